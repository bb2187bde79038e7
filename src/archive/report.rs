// Hazard report: failures cross-referenced to source timecode

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

use super::analysis::{HazardResult, HazardVerdict};
use crate::capture::timecode::{display_or_unknown, Timecode};

/// VITC/LTC pair recorded for each archived frame
pub type TimecodePair = (Option<Timecode>, Option<Timecode>);

/// Write a plain-text hazard report. Each result is listed with the source
/// VITC and LTC of the frame it refers to.
pub fn write_hazard_report(
    path: &Path,
    archive_path: &Path,
    verdict: HazardVerdict,
    results: &[HazardResult],
    timecodes: &[TimecodePair],
) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("Failed to create hazard report {}", path.display()))?;
    let mut out = BufWriter::new(file);

    writeln!(out, "Hazard analysis report")?;
    writeln!(out, "Archive: {}", archive_path.display())?;
    writeln!(out, "Generated: {}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S"))?;
    writeln!(out, "Frames analysed: {}", timecodes.len())?;
    writeln!(out, "Result: {}", match verdict {
        HazardVerdict::Passed => "PASSED",
        HazardVerdict::Failed => "FAILED",
        HazardVerdict::NotChecked => "NOT CHECKED",
    })?;
    writeln!(out)?;
    writeln!(out, "{:>8}  {:<11}  {:<11}  {:>6}  {:>6}  {:>6}  flags", "position", "VITC", "LTC", "red", "lum", "spat")?;

    for result in results {
        let (vitc, ltc) = timecodes
            .get(result.position as usize)
            .copied()
            .unwrap_or((None, None));
        let mut flags = Vec::new();
        if result.is_failure() {
            flags.push("FAIL");
        }
        if result.extended_failure {
            flags.push("EXTENDED");
        }
        writeln!(
            out,
            "{:>8}  {:<11}  {:<11}  {:>6.2}  {:>6.2}  {:>6.2}  {}",
            result.position,
            display_or_unknown(vitc),
            display_or_unknown(ltc),
            result.red_flash,
            result.luminance_flash,
            result.spatial_pattern,
            flags.join(",")
        )?;
    }

    out.flush()
        .with_context(|| format!("Failed to write hazard report {}", path.display()))?;
    log::info!("Hazard report written to {} ({} entries)", path.display(), results.len());
    Ok(())
}
