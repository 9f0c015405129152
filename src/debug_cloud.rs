//! Debug point-cloud sink: optional raw-datagram capture to disk
//! (spec §4.13).

use std::path::PathBuf;

use chrono::Local;
use crc::{Crc, CRC_16_IBM_3740};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::handle::DeviceHandle;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const HEADER_LEN: usize = 128;
const FILE_VER: u8 = 1;
const DATA_TYPE: u8 = 1;

/// Hard cap on a single capture file (spec §4.13: "writes stop at 4 GiB").
pub const MAX_FILE_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Builds the 128-byte header written once per capture file (spec §4.13):
/// `{file_ver, dev_type, data_type, sn[16], reserved[107], crc16_ccitt}`.
#[must_use]
pub fn encode_header(dev_type: u8, serial_number: &str) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = FILE_VER;
    buf[1] = dev_type;
    buf[2] = DATA_TYPE;
    let sn_bytes = serial_number.as_bytes();
    let copy_len = sn_bytes.len().min(16);
    buf[3..3 + copy_len].copy_from_slice(&sn_bytes[..copy_len]);
    // buf[19..126] stays reserved/zero.
    let crc = CRC16.checksum(&buf[..HEADER_LEN - 2]);
    buf[HEADER_LEN - 2..].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// One captured datagram, queued from the reactor thread to the dedicated
/// writer task (spec §4.13: "a dedicated writer thread drains a queue").
pub struct CaptureChunk {
    pub handle: DeviceHandle,
    pub data: Vec<u8>,
}

struct CaptureFile {
    file: File,
    written: u64,
}

/// Owns the capture file for one device and the queue its writer task
/// drains.
pub struct DebugCloudSink {
    root: PathBuf,
    tx: mpsc::Sender<CaptureChunk>,
}

impl DebugCloudSink {
    /// Spawns the writer task and returns a sink that forwards chunks to it.
    #[must_use]
    pub fn spawn(root: PathBuf, dev_type: u8, serial_number: String, handle: DeviceHandle) -> Self {
        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(writer_task(root.clone(), dev_type, serial_number, handle, rx));
        Self { root, tx }
    }

    /// Queues a raw datagram for the writer task. Drops the chunk (with a
    /// warning) if the queue is full rather than blocking the reactor.
    pub fn capture(&self, chunk: CaptureChunk) {
        if self.tx.try_send(chunk).is_err() {
            warn!("debug point-cloud capture queue full, dropping datagram");
        }
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }
}

async fn writer_task(
    root: PathBuf,
    dev_type: u8,
    serial_number: String,
    handle: DeviceHandle,
    mut rx: mpsc::Receiver<CaptureChunk>,
) {
    let timestamp = Local::now().format("%Y_%m_%d_%H_%M_%S");
    let filename = format!("lidar_{handle}_{timestamp}.LivoxDebugPointCloudData");
    let path = root.join(filename);

    let mut capture = match File::create(&path).await {
        Ok(file) => CaptureFile { file, written: 0 },
        Err(err) => {
            warn!(?err, "failed to create debug point-cloud capture file");
            return;
        }
    };

    let header = encode_header(dev_type, &serial_number);
    if let Err(err) = capture.file.write_all(&header).await {
        warn!(?err, "failed to write debug point-cloud header");
        return;
    }
    capture.written += header.len() as u64;
    info!(path = %path.display(), "debug point-cloud capture started");

    while let Some(chunk) = rx.recv().await {
        if capture.written + chunk.data.len() as u64 > MAX_FILE_SIZE {
            info!(path = %path.display(), "debug point-cloud capture reached 4 GiB cap, stopping");
            break;
        }
        if let Err(err) = capture.file.write_all(&chunk.data).await {
            warn!(?err, "failed to write debug point-cloud datagram");
            break;
        }
        capture.written += chunk.data.len() as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_128_bytes_with_trailing_crc() {
        let header = encode_header(1, "LD0001");
        assert_eq!(header.len(), HEADER_LEN);
        assert_eq!(header[0], FILE_VER);
        assert_eq!(header[1], 1);
        assert_eq!(header[2], DATA_TYPE);
        assert_eq!(&header[3..9], b"LD0001");
        let crc_expected = CRC16.checksum(&header[..HEADER_LEN - 2]);
        let crc_actual = u16::from_le_bytes([header[HEADER_LEN - 2], header[HEADER_LEN - 1]]);
        assert_eq!(crc_actual, crc_expected);
    }

    #[test]
    fn long_serial_is_truncated_to_16_bytes() {
        let header = encode_header(0, "THIS_SERIAL_IS_WAY_TOO_LONG");
        assert_eq!(&header[3..19], &b"THIS_SERIAL_IS_W"[..]);
    }

    #[tokio::test]
    async fn writer_task_creates_file_with_header() {
        let tmp = tempfile::tempdir().unwrap();
        let handle = DeviceHandle::from_ipv4("192.168.1.101".parse().unwrap());
        let sink = DebugCloudSink::spawn(tmp.path().to_path_buf(), 1, "LD0001".into(), handle);
        sink.capture(CaptureChunk { handle, data: vec![0xAA; 32] });
        drop(sink);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut entries = tokio::fs::read_dir(tmp.path()).await.unwrap();
        let entry = entries.next_entry().await.unwrap();
        assert!(entry.is_some());
    }
}
