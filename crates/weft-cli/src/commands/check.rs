//! `weft check` - validate a deployment config and print its layout.

use std::path::Path;

use console::style;

use weft_core::config::MuxConfig;
use weft_core::types::WorkClass;

use crate::error::Result;

pub fn run(path: &Path) -> Result<()> {
    let config = MuxConfig::load(path)?;

    println!(
        "{} {}",
        style("✓").green().bold(),
        style(format!("{} is valid", path.display())).bold()
    );
    println!();

    for device in &config.devices {
        let label = if device.label.is_empty() {
            format!("device {}", device.id)
        } else {
            format!("device {} ({})", device.id, device.label)
        };
        println!("{}", style(label).cyan().bold());

        let mut foreground_total = 0u32;
        let mut background_total = 0u32;
        for model in config.models_on(device.id) {
            let class = match model.class {
                WorkClass::Foreground => style("foreground").green(),
                WorkClass::Background => style("background").dim(),
            };
            let home = if model.home_device() == device.id {
                ""
            } else {
                " (migration target)"
            };
            println!(
                "  {:<20} {:>3}%  {}  split×{}{}",
                model.id, model.quota_percent, class, model.steps_per_dispatch, home
            );
            if model.home_device() == device.id {
                match model.class {
                    WorkClass::Foreground => foreground_total += model.quota_percent,
                    WorkClass::Background => background_total += model.quota_percent,
                }
            }
        }

        let total = foreground_total + background_total;
        let summary = format!(
            "  quota: {}% foreground + {}% background = {}%",
            foreground_total, background_total, total
        );
        if total > 100 {
            println!(
                "{} {}",
                style(summary).yellow(),
                style("(background shares scale down at runtime)").yellow().dim()
            );
        } else {
            println!("{}", style(summary).dim());
        }
        println!();
    }

    println!(
        "epoch {}ms, boost ×{:.1}; migration {} (ack {}ms, {} attempts)",
        config.epoch.duration_ms,
        config.epoch.boost_factor,
        if config.migration.enabled {
            "enabled"
        } else {
            "disabled"
        },
        config.migration.ack_timeout_ms,
        config.migration.max_retries,
    );

    Ok(())
}
