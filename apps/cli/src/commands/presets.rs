//! 波特率预设列表

use anyhow::Result;
use canbus_sdk::BaudRate;
use clap::Args;

/// 预设列表参数
#[derive(Args, Debug)]
pub struct PresetsCommand {
    /// 以 JSON 输出
    #[arg(long)]
    pub json: bool,
}

impl PresetsCommand {
    pub fn execute(&self) -> Result<()> {
        if self.json {
            let rows: Vec<_> = BaudRate::ALL
                .iter()
                .map(|rate| {
                    let t = rate.timing();
                    serde_json::json!({
                        "bitrate": rate.bits_per_second(),
                        "brp": t.brp,
                        "tseg1": t.tseg1,
                        "tseg2": t.tseg2,
                        "sjw": t.sjw,
                        "sample_point_percent": t.sample_point_percent(),
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows)?);
            return Ok(());
        }

        println!(
            "{:>10}  {:>5}  {:>5}  {:>5}  {:>3}  {:>7}",
            "bit/s", "brp", "tseg1", "tseg2", "sjw", "sample"
        );
        for rate in BaudRate::ALL {
            let t = rate.timing();
            println!(
                "{:>10}  {:>5}  {:>5}  {:>5}  {:>3}  {:>6.1}%",
                rate.bits_per_second(),
                t.brp,
                t.tseg1,
                t.tseg2,
                t.sjw,
                t.sample_point_percent()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_consistent() {
        for rate in BaudRate::ALL {
            assert_eq!(rate.timing().bitrate(), rate.bits_per_second());
        }
    }

    #[test]
    fn test_presets_command_runs() {
        PresetsCommand { json: false }.execute().unwrap();
        PresetsCommand { json: true }.execute().unwrap();
    }
}
