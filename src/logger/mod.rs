//! Log ingestor: reassembles streamed `PushLog` fragments into rotating
//! on-disk files (spec §4.11).

pub mod cache;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Local;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::handle::DeviceHandle;

const FLAG_ACK_REQUIRED: u8 = 0b0000_0001;
const FLAG_CREATE_FILE: u8 = 0b0000_0010;
const FLAG_END_FILE: u8 = 0b0000_0100;

/// Decoded `PushLog` packet payload (spec §4.11).
#[derive(Debug, Clone, Copy)]
pub struct PushLogHeader<'a> {
    pub log_type: u8,
    pub file_index: u8,
    pub file_num: u8,
    pub flag: u8,
    pub timestamp: u32,
    pub trans_index: u32,
    pub data: &'a [u8],
}

impl<'a> PushLogHeader<'a> {
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        if bytes.len() < 16 {
            return None;
        }
        let log_type = bytes[0];
        let file_index = bytes[1];
        let file_num = bytes[2];
        let flag = bytes[3];
        let timestamp = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        let trans_index = u32::from_le_bytes([bytes[10], bytes[11], bytes[12], bytes[13]]);
        let data_length = u16::from_le_bytes([bytes[14], bytes[15]]) as usize;
        let data = bytes.get(16..16 + data_length)?;
        Some(Self { log_type, file_index, file_num, flag, timestamp, trans_index, data })
    }

    pub fn wants_ack(&self) -> bool {
        self.flag & FLAG_ACK_REQUIRED != 0
    }

    pub fn is_create(&self) -> bool {
        self.flag & FLAG_CREATE_FILE != 0
    }

    pub fn is_end(&self) -> bool {
        self.flag & FLAG_END_FILE != 0
    }
}

/// Ack payload to send back when a `PushLog` packet requests one (spec
/// §4.11: "same `(log_type, file_index, trans_index)` and `ret_code == 0`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushLogAck {
    pub log_type: u8,
    pub file_index: u8,
    pub trans_index: u32,
}

impl PushLogAck {
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(6);
        buf.push(0u8); // ret_code == 0
        buf.push(self.log_type);
        buf.push(self.file_index);
        buf.push(0); // padding to align trans_index
        buf.extend_from_slice(&self.trans_index.to_le_bytes());
        buf
    }
}

struct OpenFile {
    temp_path: PathBuf,
    final_path: PathBuf,
    last_trans_index: u32,
}

/// Key identifying one log stream: a device's `(handle, log_type)` pair.
type StreamKey = (DeviceHandle, u8);

/// Reassembles `PushLog` fragments into rotating files under `root`
/// (spec §4.11 storage layout).
pub struct LogIngestor {
    root: PathBuf,
    open_files: Mutex<HashMap<StreamKey, OpenFile>>,
}

impl LogIngestor {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root, open_files: Mutex::new(HashMap::new()) }
    }

    fn partition_dir(&self, log_type: u8) -> PathBuf {
        self.root.join("lidar_log").join(format!("type_{log_type}"))
    }

    fn file_stem(serial: &str, log_type: u8, file_index: u8) -> String {
        let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        format!("{timestamp}_{serial}_{log_type}_{file_index}.dat")
    }

    /// Renames any leftover dot-files from a prior unclean shutdown back to
    /// their final names, preserving them (spec §4.11).
    pub async fn recover_dot_files(&self) -> std::io::Result<()> {
        if !self.root.join("lidar_log").exists() {
            return Ok(());
        }
        let mut type_dirs = fs::read_dir(self.root.join("lidar_log")).await?;
        while let Some(type_dir) = type_dirs.next_entry().await? {
            if !type_dir.file_type().await?.is_dir() {
                continue;
            }
            let mut entries = fs::read_dir(type_dir.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                if let Some(stripped) = name.strip_prefix('.') {
                    let final_path = entry.path().with_file_name(stripped);
                    fs::rename(entry.path(), &final_path).await?;
                    debug!(recovered = %final_path.display(), "renamed leftover dot-file from prior shutdown");
                }
            }
        }
        Ok(())
    }

    /// Handles one `PushLog` packet. Returns the ack payload to send back
    /// if the packet requested one.
    pub async fn handle_push_log(&self, handle: DeviceHandle, serial: &str, header: &PushLogHeader<'_>) -> Option<PushLogAck> {
        let key = (handle, header.log_type);

        if header.is_create() {
            self.close_stream(key, "superseded by new create").await;
            if let Err(err) = self.open_stream(key, serial, header).await {
                warn!(?err, "failed to open log file");
            }
        } else if header.is_end() {
            let mut files = self.open_files.lock().await;
            if let Some(open) = files.get(&key) {
                if open.last_trans_index.wrapping_add(1) != header.trans_index {
                    warn!(%handle, log_type = header.log_type, "trans_index gap at end-of-file");
                }
            }
            drop(files);
            self.close_stream(key, "end-file flag").await;
        } else {
            self.append_transfer(key, header).await;
        }

        header.wants_ack().then_some(PushLogAck {
            log_type: header.log_type,
            file_index: header.file_index,
            trans_index: header.trans_index,
        })
    }

    async fn open_stream(&self, key: StreamKey, serial: &str, header: &PushLogHeader<'_>) -> std::io::Result<()> {
        let dir = self.partition_dir(header.log_type);
        fs::create_dir_all(&dir).await?;
        let stem = Self::file_stem(serial, header.log_type, header.file_index);
        let temp_path = dir.join(format!(".{stem}"));
        let final_path = dir.join(stem);
        fs::File::create(&temp_path).await?;

        self.open_files.lock().await.insert(
            key,
            OpenFile { temp_path, final_path, last_trans_index: header.trans_index },
        );
        Ok(())
    }

    async fn append_transfer(&self, key: StreamKey, header: &PushLogHeader<'_>) {
        let mut files = self.open_files.lock().await;
        let Some(open) = files.get_mut(&key) else {
            debug!("transfer for a log stream with no open file, dropped");
            return;
        };
        if header.trans_index < open.last_trans_index {
            debug!(trans_index = header.trans_index, "out-of-order transfer discarded");
            return;
        }
        open.last_trans_index = header.trans_index;
        let path = open.temp_path.clone();
        drop(files);

        match fs::OpenOptions::new().append(true).open(&path).await {
            Ok(mut file) => {
                if let Err(err) = file.write_all(header.data).await {
                    warn!(?err, "failed to append log data");
                }
            }
            Err(err) => warn!(?err, "failed to open temp log file for append"),
        }
    }

    async fn close_stream(&self, key: StreamKey, reason: &str) {
        let open = self.open_files.lock().await.remove(&key);
        if let Some(open) = open {
            if let Err(err) = fs::rename(&open.temp_path, &open.final_path).await {
                warn!(?err, "failed to rename closed log file");
            } else {
                debug!(path = %open.final_path.display(), reason, "log file closed");
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(flag: u8, trans_index: u32, data: &'static [u8]) -> Vec<u8> {
        let mut buf = vec![0u8; 16];
        buf[0] = 1; // log_type
        buf[1] = 0; // file_index
        buf[2] = 1; // file_num
        buf[3] = flag;
        buf[10..14].copy_from_slice(&trans_index.to_le_bytes());
        buf[14..16].copy_from_slice(&(data.len() as u16).to_le_bytes());
        buf.extend_from_slice(data);
        buf
    }

    #[test]
    fn parses_create_header_with_data() {
        let bytes = header(FLAG_CREATE_FILE | FLAG_ACK_REQUIRED, 0, b"hello");
        let parsed = PushLogHeader::parse(&bytes).unwrap();
        assert!(parsed.is_create());
        assert!(parsed.wants_ack());
        assert_eq!(parsed.data, b"hello");
    }

    #[tokio::test]
    async fn create_transfer_end_writes_final_file() {
        let tmp = tempfile::tempdir().unwrap();
        let ingestor = LogIngestor::new(tmp.path().to_path_buf());
        let handle = DeviceHandle::from_ipv4("192.168.1.101".parse().unwrap());

        let create = PushLogHeader::parse(&header(FLAG_CREATE_FILE, 0, b"")).unwrap();
        ingestor.handle_push_log(handle, "LD0001", &create).await;

        let xfer = PushLogHeader::parse(&header(0, 1, b"chunk-one")).unwrap();
        ingestor.handle_push_log(handle, "LD0001", &xfer).await;

        let end = PushLogHeader::parse(&header(FLAG_END_FILE, 2, b"")).unwrap();
        ingestor.handle_push_log(handle, "LD0001", &end).await;

        let dir = tmp.path().join("lidar_log").join("type_1");
        let mut entries = tokio::fs::read_dir(&dir).await.unwrap();
        let mut found_final = false;
        while let Some(entry) = entries.next_entry().await.unwrap() {
            let name = entry.file_name().to_string_lossy().to_string();
            assert!(!name.starts_with('.'), "file should have been renamed on close");
            found_final = true;
        }
        assert!(found_final);
    }

    #[tokio::test]
    async fn out_of_order_transfer_is_discarded() {
        let tmp = tempfile::tempdir().unwrap();
        let ingestor = LogIngestor::new(tmp.path().to_path_buf());
        let handle = DeviceHandle::from_ipv4("192.168.1.101".parse().unwrap());

        let create = PushLogHeader::parse(&header(FLAG_CREATE_FILE, 5, b"")).unwrap();
        ingestor.handle_push_log(handle, "LD0001", &create).await;

        let stale = PushLogHeader::parse(&header(0, 2, b"stale")).unwrap();
        ingestor.handle_push_log(handle, "LD0001", &stale).await;

        let files = ingestor.open_files.lock().await;
        assert_eq!(files.get(&(handle, 1)).unwrap().last_trans_index, 5);
    }

    #[tokio::test]
    async fn ack_request_yields_matching_ack_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let ingestor = LogIngestor::new(tmp.path().to_path_buf());
        let handle = DeviceHandle::from_ipv4("192.168.1.101".parse().unwrap());
        let create = PushLogHeader::parse(&header(FLAG_CREATE_FILE | FLAG_ACK_REQUIRED, 7, b"")).unwrap();
        let ack = ingestor.handle_push_log(handle, "LD0001", &create).await.unwrap();
        assert_eq!(ack, PushLogAck { log_type: 1, file_index: 0, trans_index: 7 });
    }
}
