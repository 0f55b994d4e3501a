//! The output file, memory mapped and sized up front.
//!
//! The file is a flat run of samples with no header. Its format is carried by
//! the file name (`-c64.bin` / `-i16.bin`) and by a small `KEY VALUE` text
//! record written next to it.

use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::{DateTime, Datelike, Timelike, Utc};
use memmap2::MmapMut;
use tracing::{error, info};

use crate::{error::CaptureError, format::SampleFormat};

pub struct OutputRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
    format: SampleFormat,
    buffer_len: usize,
    blocks: u64,
    scratch: Vec<i16>,
}

impl OutputRegion {
    /// Create (or truncate) `path` to hold `blocks` device buffers of
    /// `buffer_len` samples each and map it
    pub fn create(
        path: impl AsRef<Path>,
        format: SampleFormat,
        buffer_len: usize,
        blocks: u64,
    ) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        if blocks == 0 || buffer_len == 0 {
            return Err(CaptureError::EmptyPlan(format!(
                "{blocks} blocks of {buffer_len} samples"
            )));
        }
        let bytes = (buffer_len as u64)
            .checked_mul(format.element_size() as u64)
            .and_then(|b| b.checked_mul(blocks))
            .ok_or_else(|| CaptureError::Config("output region size overflows".to_owned()))?;
        let io_err = |source: io::Error| CaptureError::Output {
            path: path.clone(),
            source,
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(io_err)?;
        file.set_len(bytes).map_err(io_err)?;
        // Safety: we just created and sized the file and hold the only handle.
        // Another process truncating it under us would fault, same as any mmap.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err)?;
        Ok(Self {
            path,
            file,
            map,
            format,
            buffer_len,
            blocks,
            scratch: Vec::with_capacity(2 * buffer_len),
        })
    }

    fn block_bytes(&self) -> usize {
        self.buffer_len * self.format.element_size()
    }

    /// Store one device buffer (interleaved I/Q floats) as block `index`
    pub fn write_block(&mut self, index: u64, iq: &[f32]) -> Result<(), CaptureError> {
        if index >= self.blocks {
            return Err(CaptureError::OutOfBounds {
                index,
                blocks: self.blocks,
            });
        }
        if iq.len() != 2 * self.buffer_len {
            return Err(CaptureError::BlockSize {
                got: iq.len() * std::mem::size_of::<f32>(),
                expected: 2 * self.buffer_len * std::mem::size_of::<f32>(),
            });
        }
        let size = self.block_bytes();
        let offset = index as usize * size;
        self.format
            .encode(iq, &mut self.map[offset..offset + size], &mut self.scratch);
        Ok(())
    }

    /// The raw bytes of block `index`
    pub fn block(&self, index: u64) -> Option<&[u8]> {
        if index >= self.blocks {
            return None;
        }
        let size = self.block_bytes();
        let offset = index as usize * size;
        Some(&self.map[offset..offset + size])
    }

    /// Write dirty pages back and wait for the disk
    pub fn flush(&self) -> Result<(), CaptureError> {
        self.map.flush().map_err(|e| self.io_error(e))?;
        self.file.sync_data().map_err(|e| self.io_error(e))
    }

    /// Start write-back without waiting for it
    pub fn flush_async(&self) -> Result<(), CaptureError> {
        self.map.flush_async().map_err(|e| self.io_error(e))
    }

    /// Touch every page of the file so the filesystem allocates it now instead
    /// of during the capture. Returns the write speed in samples per second.
    pub fn preallocate(&mut self) -> Result<f64, CaptureError> {
        info!(
            "preallocating output file ({:.1} MB)",
            self.map.len() as f64 / 1e6
        );
        let size = self.block_bytes();
        let start = Instant::now();
        for chunk in self.map.chunks_mut(size) {
            chunk.fill(0);
        }
        self.flush()?;
        let elapsed = start.elapsed().as_secs_f64().max(f64::EPSILON);
        Ok(self.len_samples() as f64 / elapsed)
    }

    fn io_error(&self, source: io::Error) -> CaptureError {
        CaptureError::Output {
            path: self.path.clone(),
            source,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn buffer_len(&self) -> usize {
        self.buffer_len
    }

    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn len_samples(&self) -> u64 {
        self.blocks * self.buffer_len as u64
    }

    pub fn len_bytes(&self) -> usize {
        self.map.len()
    }
}

/// Check a preallocation benchmark against the rate we need to sustain
pub fn check_write_speed(samples_per_sec: f64, sample_rate: f64) -> bool {
    info!(
        "write speed is {:5.1} MSa/s; required {:5.1} MSa/s",
        samples_per_sec / 1e6,
        sample_rate / 1e6
    );
    if samples_per_sec < sample_rate {
        error!("disk write speed not adequate for sample rate");
        return false;
    }
    true
}

/// `<stem>-c64.bin` or `<stem>-i16.bin`
pub fn output_path(stem: &Path, format: SampleFormat) -> PathBuf {
    let mut name = stem.as_os_str().to_owned();
    name.push(format!("-{}.bin", format.file_suffix()));
    PathBuf::from(name)
}

/// Where the metadata record for `data` goes
pub fn sidecar_path(data: &Path) -> PathBuf {
    let mut name = data.as_os_str().to_owned();
    name.push(".hdr");
    PathBuf::from(name)
}

/// Convert a chrono DateTime into a `YYYY-MM-DD-hh:mm:ss` timestamp
fn utc_stamp(time: &DateTime<Utc>) -> String {
    format!(
        "{}-{:02}-{:02}-{:02}:{:02}:{:02}",
        time.year(),
        time.month(),
        time.day(),
        time.hour(),
        time.minute(),
        time.second()
    )
}

/// Everything a reader needs to interpret the headerless data file
#[derive(Clone, Debug, PartialEq)]
pub struct CaptureMetadata {
    pub format: SampleFormat,
    pub sample_rate: f64,
    pub center_frequency: f64,
    pub buffer_len: usize,
    pub samples: u64,
    pub utc_start: DateTime<Utc>,
}

impl CaptureMetadata {
    pub fn header(&self) -> BTreeMap<&'static str, String> {
        BTreeMap::from([
            ("FORMAT", self.format.to_string()),
            ("ELEMENT_SIZE", self.format.element_size().to_string()),
            ("SAMPLE_RATE", self.sample_rate.to_string()),
            ("CENTER_FREQ", self.center_frequency.to_string()),
            ("BUFFER_LEN", self.buffer_len.to_string()),
            ("NSAMP", self.samples.to_string()),
            ("UTC_START", utc_stamp(&self.utc_start)),
        ])
    }

    /// Write the record next to `data` and return its path
    pub fn write_sidecar(&self, data: &Path) -> Result<PathBuf, CaptureError> {
        let path = sidecar_path(data);
        let text: String = self
            .header()
            .into_iter()
            .map(|(k, v)| format!("{k} {v}\n"))
            .collect();
        fs::write(&path, text).map_err(|source| CaptureError::Output {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_blocks_land_at_their_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region-c64.bin");
        let mut region = OutputRegion::create(&path, SampleFormat::Cf32, 2, 3).unwrap();
        assert_eq!(region.len_bytes(), 3 * 2 * 8);
        region.write_block(2, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        region.write_block(0, &[5.0, 6.0, 7.0, 8.0]).unwrap();
        region.flush().unwrap();
        drop(region);

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 48);
        let floats: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(&floats[..4], &[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(&floats[4..8], &[0.0; 4]);
        assert_eq!(&floats[8..], &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_rejects_bad_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        let mut region = OutputRegion::create(&path, SampleFormat::Ci16, 2, 1).unwrap();
        assert_eq!(region.len_bytes(), 8);
        assert!(matches!(
            region.write_block(1, &[0.0; 4]),
            Err(CaptureError::OutOfBounds { index: 1, blocks: 1 })
        ));
        assert!(matches!(
            region.write_block(0, &[0.0; 3]),
            Err(CaptureError::BlockSize { .. })
        ));
        assert!(region.block(1).is_none());
        assert!(matches!(
            OutputRegion::create(&path, SampleFormat::Ci16, 2, 0),
            Err(CaptureError::EmptyPlan(_))
        ));
    }

    #[test]
    fn test_preallocate_zeroes() {
        let dir = tempfile::tempdir().unwrap();
        let mut region =
            OutputRegion::create(dir.path().join("p.bin"), SampleFormat::Cf32, 16, 4).unwrap();
        region.write_block(1, &[1.0; 32]).unwrap();
        let speed = region.preallocate().unwrap();
        assert!(speed > 0.0);
        assert!(region.block(1).unwrap().iter().all(|&b| b == 0));
        assert!(check_write_speed(2.0, 1.0));
        assert!(!check_write_speed(1.0, 2.0));
    }

    #[test]
    fn test_naming_and_sidecar() {
        let dir = tempfile::tempdir().unwrap();
        let data = output_path(&dir.path().join("capture"), SampleFormat::Ci16);
        assert!(data.to_string_lossy().ends_with("capture-i16.bin"));

        let meta = CaptureMetadata {
            format: SampleFormat::Ci16,
            sample_rate: 56e6,
            center_frequency: 1e9,
            buffer_len: 2040,
            samples: 4080,
            utc_start: Utc.with_ymd_and_hms(2023, 5, 24, 7, 3, 9).unwrap(),
        };
        let hdr = meta.write_sidecar(&data).unwrap();
        assert_eq!(hdr, sidecar_path(&data));
        let text = fs::read_to_string(hdr).unwrap();
        assert!(text.contains("FORMAT ci16\n"));
        assert!(text.contains("ELEMENT_SIZE 4\n"));
        assert!(text.contains("NSAMP 4080\n"));
        assert!(text.contains("UTC_START 2023-05-24-07:03:09\n"));
    }
}
