//! Elementary-stream file sink
//!
//! Writes the payload of one track back to back: for H.264 that is an Annex B
//! byte stream playable with `ffplay -f h264`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use super::ContainerSink;
use crate::error::SinkError;
use crate::pipeline::types::{MediaKind, MediaPacket, Rational};

pub struct AnnexBFileSink {
    path: PathBuf,
    kind: MediaKind,
    timebase: Rational,
    writer: Option<BufWriter<File>>,
    bytes_written: u64,
}

impl AnnexBFileSink {
    pub fn create(path: impl AsRef<Path>, kind: MediaKind, timebase: Rational) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            path,
            kind,
            timebase,
            writer: Some(BufWriter::new(file)),
            bytes_written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl ContainerSink for AnnexBFileSink {
    fn timebase(&self, kind: MediaKind) -> Option<Rational> {
        (kind == self.kind).then_some(self.timebase)
    }

    fn write(&mut self, packet: MediaPacket) -> Result<(), SinkError> {
        let Some(writer) = self.writer.as_mut() else {
            return Err(SinkError::Closed(format!("{} already finalized", self.path.display())));
        };
        writer.write_all(&packet.data)?;
        self.bytes_written += packet.data.len() as u64;
        Ok(())
    }

    fn write_trailer(&mut self) -> Result<(), SinkError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_writes_payloads_back_to_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.h264");
        let tb = Rational::per_second(90_000);
        let mut sink = AnnexBFileSink::create(&path, MediaKind::Video, tb).unwrap();
        assert_eq!(sink.timebase(MediaKind::Video), Some(tb));
        assert_eq!(sink.timebase(MediaKind::Audio), None);

        for nal in [&[0u8, 0, 0, 1, 0x67][..], &[0, 0, 0, 1, 0x65, 9]] {
            sink.write(MediaPacket::new(MediaKind::Video, Bytes::copy_from_slice(nal), 0, tb))
                .unwrap();
        }
        sink.write_trailer().unwrap();
        assert_eq!(sink.bytes_written(), 11);
        assert_eq!(std::fs::read(&path).unwrap(), vec![0, 0, 0, 1, 0x67, 0, 0, 0, 1, 0x65, 9]);

        let late = MediaPacket::new(MediaKind::Video, Bytes::from_static(&[1]), 0, tb);
        assert!(matches!(sink.write(late), Err(SinkError::Closed(_))));
    }
}
