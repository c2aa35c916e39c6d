//! 控制器整体行为的性质测试
//!
//! 队列上界、FIFO 顺序、过滤正确性、状态单调性、恢复幂等、回环一致性，
//! 以及两个端到端场景。全部运行在虚拟总线上。

use canbus_sdk::driver::BusStateMachine;
use canbus_sdk::driver::state::ErrorThresholds;
use canbus_sdk::hal::{BusErrorKind, FaultInjector};
use canbus_sdk::prelude::*;
use crossbeam_channel::unbounded;
use proptest::prelude::*;
use rand::Rng;
use serial_test::serial;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}

fn controller_with(config: BusConfig) -> (BusController, FaultInjector) {
    let bus = VirtualBus::new();
    let node = bus.attach();
    let faults = node.fault_injector();
    let controller = BusControllerBuilder::new()
        .hardware(node)
        .config(config)
        .build()
        .unwrap();
    (controller, faults)
}

fn loopback() -> BusConfig {
    BusConfig::with_mode(OperatingMode::Loopback)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    /// 深度为 N 的发送队列：N 次发送成功后，第 N+1 次零超时发送返回 QueueFull
    #[test]
    fn prop_queue_bound(depth in 1usize..=64) {
        let (controller, faults) = controller_with(BusConfig {
            tx_queue_depth: depth,
            ..loopback()
        });
        faults.hold_transmissions(true);
        controller.start().unwrap();

        for i in 0..depth {
            let frame = CanFrame::new_standard(i as u16, &[]).unwrap();
            prop_assert!(controller.send(frame, Duration::ZERO).is_ok());
        }
        let extra = CanFrame::new_standard(0x7FF, &[]).unwrap();
        prop_assert!(matches!(
            controller.send(extra, Duration::ZERO),
            Err(DriverError::QueueFull)
        ));
        prop_assert_eq!(controller.statistics().queue_full_events, 1);
        controller.stop().unwrap();
    }

    /// 状态机只在相邻状态之间迁移，且遵循阈值顺序
    #[test]
    fn prop_state_machine_never_skips(errors in proptest::collection::vec(any::<bool>(), 1..200)) {
        let mut machine = BusStateMachine::new(ErrorThresholds::default());
        machine.start().unwrap();

        let order = [
            BusState::Running,
            BusState::ErrorWarning,
            BusState::ErrorPassive,
            BusState::BusOff,
        ];
        let rank = |s: BusState| order.iter().position(|o| *o == s).unwrap();

        for tx_error in errors {
            let transitions = if tx_error {
                machine.record_tx_error()
            } else {
                machine.record_tx_success()
            };
            for t in transitions {
                prop_assert_eq!(rank(t.from).abs_diff(rank(t.to)), 1);
            }
            let tec = machine.counters().tec;
            let expected = match tec {
                0..=95 => BusState::Running,
                96..=127 => BusState::ErrorWarning,
                128..=255 => BusState::ErrorPassive,
                _ => BusState::BusOff,
            };
            if machine.state() != BusState::BusOff {
                prop_assert_eq!(machine.state(), expected);
            }
        }
    }
}

/// 没有溢出时，接收顺序与硬件上报顺序一致
#[test]
fn test_fifo_ordering() {
    let (controller, faults) = controller_with(BusConfig {
        rx_queue_depth: 64,
        ..loopback()
    });
    controller.start().unwrap();

    let mut rng = rand::thread_rng();
    let ids: Vec<u16> = (0..64).map(|_| rng.gen_range(0..=0x7FF)).collect();
    for (seq, id) in ids.iter().enumerate() {
        faults.inject_frame(CanFrame::new_standard(*id, &[seq as u8]).unwrap());
    }

    for (seq, id) in ids.iter().enumerate() {
        let frame = controller.receive(Duration::from_secs(1)).unwrap();
        assert_eq!(frame.id(), u32::from(*id));
        assert_eq!(frame.data(), &[seq as u8]);
    }
    assert_eq!(controller.statistics().rx_overflow, 0);
    controller.stop().unwrap();
}

/// 规则 {id=0x123, mask=0x7FF}：0x123 接收，0x124 丢弃并计数
#[test]
fn test_filter_correctness() {
    let (controller, _faults) = controller_with(BusConfig {
        filters: vec![FilterRule::mask(0x123, 0x7FF, FrameScope::Standard)],
        ..loopback()
    });
    controller.start().unwrap();

    controller
        .send(CanFrame::new_standard(0x124, &[2]).unwrap(), Duration::from_millis(10))
        .unwrap();
    controller
        .send(CanFrame::new_standard(0x123, &[1]).unwrap(), Duration::from_millis(10))
        .unwrap();

    let frame = controller.receive(Duration::from_secs(1)).unwrap();
    assert_eq!(frame.id(), 0x123);
    assert_eq!(controller.statistics().filtered_out, 1);
    controller.stop().unwrap();
}

/// 错误计数递增：Running → ErrorWarning → ErrorPassive → BusOff，不跳级
#[test]
#[serial]
fn test_state_monotonicity_through_controller() {
    let (controller, faults) = controller_with(BusConfig {
        alert_mask: AlertFlags::ALL,
        ..loopback()
    });
    let (tx, rx) = unbounded();
    controller.add_alert_callback(Arc::new(move |flags: AlertFlags| {
        let _ = tx.send(flags);
    }));
    controller.start().unwrap();

    faults.inject_bus_errors(BusErrorKind::Transmit, 40);
    assert!(wait_for(|| controller.state() == BusState::BusOff));

    let watched = AlertFlags::ABOVE_ERR_WARN | AlertFlags::ERR_PASS | AlertFlags::BUS_OFF;
    let mut seen = Vec::new();
    while let Ok(flags) = rx.recv_timeout(Duration::from_millis(50)) {
        let state_alerts = flags & watched;
        if !state_alerts.is_empty() {
            seen.push(state_alerts);
        }
    }
    assert_eq!(
        seen,
        vec![
            AlertFlags::ABOVE_ERR_WARN,
            AlertFlags::ERR_PASS,
            AlertFlags::BUS_OFF
        ]
    );

    let stats = controller.statistics();
    assert_eq!(stats.error_warning_events, 1);
    assert_eq!(stats.error_passive_events, 1);
    assert_eq!(stats.bus_off_events, 1);
    controller.stop().unwrap();
}

/// 不处于 BusOff 时恢复是空操作
#[test]
fn test_recovery_idempotence() {
    let (controller, faults) = controller_with(loopback());
    controller.start().unwrap();

    faults.inject_error_counters(100, 3);
    assert!(wait_for(|| controller.state() == BusState::ErrorWarning));
    let before = controller.diagnostics();

    controller.recover_from_error().unwrap();
    controller.recover_from_error().unwrap();

    let after = controller.diagnostics();
    assert_eq!(after.state, BusState::ErrorWarning);
    assert_eq!((after.tec, after.rec), (before.tec, before.rec));
    assert_eq!(controller.statistics().recoveries, 0);
    assert_eq!(faults.resets(), 0);
    controller.stop().unwrap();
}

/// 回环模式：标识符、标志与数据完全一致
#[test]
fn test_loopback_roundtrip_preserves_content() {
    let (controller, _faults) = controller_with(loopback());
    controller.start().unwrap();

    let frames = [
        CanFrame::new_standard(0x000, &[]).unwrap(),
        CanFrame::new_standard(0x7FF, &[0xFF; 8]).unwrap(),
        CanFrame::new_extended(0x1FFF_FFFF, &[1, 2, 3]).unwrap(),
        CanFrame::new_remote_standard(0x321, 4).unwrap(),
        CanFrame::new_remote_extended(0x0ABC_DEF0, 0).unwrap(),
    ];
    for sent in frames {
        controller.send(sent, Duration::from_millis(50)).unwrap();
        let received = controller.receive(Duration::from_secs(1)).unwrap();
        assert!(received.same_content(&sent), "{} != {}", received, sent);
        assert_eq!(received.is_extended(), sent.is_extended());
        assert_eq!(received.is_remote(), sent.is_remote());
        assert_eq!(received.dlc(), sent.dlc());
    }
    controller.stop().unwrap();
}

/// 场景：发送深度 4，0x100..0x104 零超时发送，第 5 帧 QueueFull
#[test]
fn test_scenario_queue_full() {
    let (controller, faults) = controller_with(BusConfig {
        tx_queue_depth: 4,
        ..loopback()
    });
    faults.hold_transmissions(true);
    controller.start().unwrap();

    let results: Vec<_> = (0x100..=0x104u16)
        .map(|id| controller.send(CanFrame::new_standard(id, &[]).unwrap(), Duration::ZERO))
        .collect();

    assert!(results[..4].iter().all(|r| r.is_ok()));
    assert!(matches!(results[4], Err(DriverError::QueueFull)));
    assert_eq!(controller.statistics().queue_full_events, 1);
    controller.stop().unwrap();
}

/// 场景：256 次发送错误进入 BusOff，恢复后回到 Running 且计数清零
#[test]
#[serial]
fn test_scenario_bus_off_recovery() {
    let (controller, faults) = controller_with(loopback());
    controller.start().unwrap();

    faults.inject_bus_errors(BusErrorKind::Transmit, 256);
    assert!(wait_for(|| controller.state() == BusState::BusOff));

    controller.recover_from_error().unwrap();
    assert_eq!(controller.state(), BusState::Running);

    let diag = controller.diagnostics();
    assert_eq!(diag.tec, 0);
    assert_eq!(diag.rec, 0);
    assert_eq!(diag.bus_errors, 0);
    assert_eq!(diag.arbitration_lost, 0);
    assert_eq!(diag.consecutive_errors, 0);
    controller.stop().unwrap();
}
