// Browse timecode log: one line per browse frame
//
//   C00:00:00:00 V10:00:00:00 L10:00:00:00

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::capture::timecode::{display_or_unknown, Timecode};

pub fn format_line(control: Timecode, vitc: Option<Timecode>, ltc: Option<Timecode>) -> String {
    format!(
        "C{} V{} L{}",
        control,
        display_or_unknown(vitc),
        display_or_unknown(ltc)
    )
}

pub struct TimecodeLog {
    writer: BufWriter<File>,
    lines: u64,
}

impl TimecodeLog {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            writer: BufWriter::new(File::create(path)?),
            lines: 0,
        })
    }

    pub fn write(&mut self, control: Timecode, vitc: Option<Timecode>, ltc: Option<Timecode>) -> std::io::Result<()> {
        writeln!(self.writer, "{}", format_line(control, vitc, ltc))?;
        self.lines += 1;
        Ok(())
    }

    pub fn finish(mut self) -> std::io::Result<u64> {
        self.writer.flush()?;
        Ok(self.lines)
    }
}
