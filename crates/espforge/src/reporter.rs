use std::io::{self, Stdout, Write};

use pbr::{ProgressBar, Units};

/// Passes writes through to `inner` and advances a byte progress bar on stdout.
pub struct ProgressBarReporter<T> {
    pb: ProgressBar<Stdout>,
    inner: T,
}

impl<T> ProgressBarReporter<T>
where
    T: Write,
{
    pub fn new(total_bytes: u64, message: &str, inner: T) -> Self {
        let mut pb = ProgressBar::new(total_bytes);
        pb.set_units(Units::Bytes);
        pb.message(message);

        Self { pb, inner }
    }

    pub fn finish(&mut self, summary: &str) {
        self.pb.finish_print(summary);
    }
}

impl<T> Write for ProgressBarReporter<T>
where
    T: Write,
{
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.pb.add(written as u64);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
