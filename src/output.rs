use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;

use crate::cli::OutputFormat;

/// Formats random bytes block by block as they are read.
///
/// Base64 works on 3-byte groups, so up to two bytes of each block are held
/// back and prepended to the next one; `finish` flushes them with padding.
pub struct Sink<W: Write> {
    out: W,
    format: OutputFormat,
    carry: Vec<u8>,
    wrote_text: bool,
}

impl Sink<Box<dyn Write>> {
    /// Stdout, or a freshly created file.
    pub fn open(format: OutputFormat, output_file: Option<&Path>) -> io::Result<Self> {
        let out: Box<dyn Write> = match output_file {
            Some(path) => Box::new(BufWriter::new(File::create(path)?)),
            None => Box::new(BufWriter::new(io::stdout())),
        };
        Ok(Sink::new(out, format))
    }
}

impl<W: Write> Sink<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            carry: Vec::with_capacity(3),
            wrote_text: false,
        }
    }

    pub fn write_block(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.format {
            OutputFormat::Raw => self.out.write_all(bytes)?,
            OutputFormat::Hex => {
                for b in bytes {
                    write!(self.out, "{:02x}", b)?;
                }
            }
            OutputFormat::HexUpper => {
                for b in bytes {
                    write!(self.out, "{:02X}", b)?;
                }
            }
            OutputFormat::Base64 | OutputFormat::Base64url => {
                self.carry.extend_from_slice(bytes);
                let whole = self.carry.len() - self.carry.len() % 3;
                if whole > 0 {
                    let text = self.encode(&self.carry[..whole]);
                    self.out.write_all(text.as_bytes())?;
                    self.carry.drain(..whole);
                }
            }
        }
        self.wrote_text |= !bytes.is_empty();
        Ok(())
    }

    fn encode(&self, bytes: &[u8]) -> String {
        match self.format {
            OutputFormat::Base64url => URL_SAFE_NO_PAD.encode(bytes),
            _ => STANDARD.encode(bytes),
        }
    }

    /// Write out anything held back, end text formats with a newline, and
    /// hand back the writer.
    pub fn finish(mut self) -> io::Result<W> {
        if !self.carry.is_empty() {
            let text = self.encode(&self.carry);
            self.out.write_all(text.as_bytes())?;
            self.carry.clear();
        }
        if self.format != OutputFormat::Raw && self.wrote_text {
            writeln!(self.out)?;
        }
        self.out.flush()?;
        Ok(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn streamed(blocks: &[&[u8]], format: OutputFormat) -> String {
        let mut sink = Sink::new(Vec::new(), format);
        for b in blocks {
            sink.write_block(b).unwrap();
        }
        String::from_utf8(sink.finish().unwrap()).unwrap()
    }

    #[test]
    fn test_hex() {
        assert_eq!(streamed(&[&[0xde, 0xad], &[0xbe, 0xef]], OutputFormat::Hex), "deadbeef\n");
    }

    #[test]
    fn test_hex_upper() {
        assert_eq!(
            streamed(&[&[0xde, 0xad, 0xbe, 0xef]], OutputFormat::HexUpper),
            "DEADBEEF\n"
        );
    }

    #[test]
    fn test_raw() {
        let mut sink = Sink::new(Vec::new(), OutputFormat::Raw);
        sink.write_block(&[1, 2]).unwrap();
        sink.write_block(&[3]).unwrap();
        assert_eq!(sink.finish().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_base64_across_uneven_blocks() {
        let data: Vec<u8> = (0u8..20).collect();
        let whole = streamed(&[&data], OutputFormat::Base64);
        let split = streamed(&[&data[..1], &data[1..8], &data[8..]], OutputFormat::Base64);
        assert_eq!(whole, format!("{}\n", STANDARD.encode(&data)));
        assert_eq!(split, whole);
    }

    #[test]
    fn test_base64url_unpadded() {
        let out = streamed(&[&[0xfb], &[0xff, 0xfe, 0xfb]], OutputFormat::Base64url);
        assert_eq!(out, format!("{}\n", URL_SAFE_NO_PAD.encode([0xfb, 0xff, 0xfe, 0xfb])));
        assert!(!out.contains('+') && !out.contains('/') && !out.contains('='));
    }

    #[test]
    fn test_empty_output_has_no_newline() {
        assert_eq!(streamed(&[], OutputFormat::Hex), "");
    }
}
