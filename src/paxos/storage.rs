use std::collections::BTreeMap;
use std::io::ErrorKind;

use async_std::fs;
use async_std::fs::{File, OpenOptions};
use async_std::path::{Path, PathBuf};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::paxos::codec::{Reader, put_bytes};
use crate::paxos::error::{PaxosError, PaxosResult};
use crate::paxos::snapshot::Snapshot;
use crate::paxos::{InstanceId, View};

const VIEW_PATH: &str = "view.bin";
const EPOCH_PATH: &str = "epoch.bin";
const LOG_PATH: &str = "log.bin";
const SNAPSHOT_PATH: &str = "snapshot.bin";

const FLAG_DECIDED: u8 = 1;
const FLAG_HAS_VALUE: u8 = 2;

// Durable state of one replica. Writes complete before they return, so the
// protocol loop only answers a message once the state backing the answer is
// safe.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn append_or_update_instance(
        &mut self,
        id: InstanceId,
        view: View,
        value: Option<&Bytes>,
        decided: bool,
    ) -> PaxosResult<()>;

    // Returns the latest persisted version of every instance, ordered by id.
    async fn read_log(&mut self) -> PaxosResult<Vec<StoredInstance>>;

    async fn read_view(&mut self) -> PaxosResult<View>;
    async fn write_view(&mut self, view: View) -> PaxosResult<()>;

    async fn read_epoch(&mut self) -> PaxosResult<u64>;
    async fn write_epoch(&mut self, epoch: u64) -> PaxosResult<()>;

    // Stores the snapshot and forgets all instances it covers.
    async fn write_snapshot(&mut self, snapshot: &Snapshot) -> PaxosResult<()>;
    async fn read_snapshot(&mut self) -> PaxosResult<Option<Snapshot>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredInstance {
    pub id: InstanceId,
    pub view: View,
    pub value: Option<Bytes>,
    pub decided: bool,
}

#[derive(Debug, Clone)]
pub enum PersistenceOptions {
    Directory { path: String, wipe: bool },
    InMemory,
}

pub async fn new(options: &PersistenceOptions) -> PaxosResult<Box<dyn Storage>> {
    match options {
        PersistenceOptions::Directory { path, wipe } => {
            Ok(Box::new(FileStorage::new(path.as_str(), *wipe).await?))
        }
        PersistenceOptions::InMemory => Ok(Box::new(MemoryStorage::new())),
    }
}

// Keeps everything in memory. Used with the crash-stop model, where nothing
// needs to survive the process.
pub struct MemoryStorage {
    view: View,
    epoch: u64,
    instances: BTreeMap<InstanceId, StoredInstance>,
    snapshot: Option<Snapshot>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            view: 0,
            epoch: 0,
            instances: BTreeMap::new(),
            snapshot: None,
        }
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append_or_update_instance(
        &mut self,
        id: InstanceId,
        view: View,
        value: Option<&Bytes>,
        decided: bool,
    ) -> PaxosResult<()> {
        let stored = StoredInstance {
            id,
            view,
            value: value.cloned(),
            decided,
        };
        self.instances.insert(id, stored);
        Ok(())
    }

    async fn read_log(&mut self) -> PaxosResult<Vec<StoredInstance>> {
        Ok(self.instances.values().cloned().collect())
    }

    async fn read_view(&mut self) -> PaxosResult<View> {
        Ok(self.view)
    }

    async fn write_view(&mut self, view: View) -> PaxosResult<()> {
        self.view = view;
        Ok(())
    }

    async fn read_epoch(&mut self) -> PaxosResult<u64> {
        Ok(self.epoch)
    }

    async fn write_epoch(&mut self, epoch: u64) -> PaxosResult<()> {
        self.epoch = epoch;
        Ok(())
    }

    async fn write_snapshot(&mut self, snapshot: &Snapshot) -> PaxosResult<()> {
        self.instances = self.instances.split_off(&snapshot.next_instance_id);
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    async fn read_snapshot(&mut self) -> PaxosResult<Option<Snapshot>> {
        Ok(self.snapshot.clone())
    }
}

// Stores state in a directory. The log is an append-only file of instance
// records where later records for the same id win. Small files are replaced
// atomically by writing a temporary file and renaming it.
pub struct FileStorage {
    directory: PathBuf,
    log: Option<File>,
}

impl FileStorage {
    pub async fn new(directory: &str, wipe: bool) -> PaxosResult<Self> {
        if wipe {
            match fs::remove_dir_all(directory).await {
                Ok(()) => info!(directory, "wiped persistent state"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        create_dir_if_not_exists(directory).await?;
        info!("Created file storage backed by directory {}", directory);
        Ok(FileStorage {
            directory: PathBuf::from(directory),
            log: None,
        })
    }

    fn path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    async fn log_file(&mut self) -> PaxosResult<&mut File> {
        if self.log.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.path(LOG_PATH))
                .await?;
            self.log = Some(file);
        }
        self.log
            .as_mut()
            .ok_or_else(|| PaxosError::Invariant("log file missing".to_string()))
    }

    async fn replace_file(&self, filename: &str, data: &[u8]) -> PaxosResult<()> {
        let tmp = self.path(&format!("{}.tmp", filename));
        let mut file = File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        fs::rename(&tmp, self.path(filename)).await?;
        Ok(())
    }

    async fn read_optional(&self, filename: &str) -> PaxosResult<Option<Vec<u8>>> {
        match fs::read(self.path(filename)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_u64(&self, filename: &str) -> PaxosResult<u64> {
        match self.read_optional(filename).await? {
            None => Ok(0),
            Some(data) => {
                let mut reader = Reader::new(Bytes::from(data));
                let value = reader.u64(filename)?;
                reader.finish(filename)?;
                Ok(value)
            }
        }
    }
}

#[async_trait]
impl Storage for FileStorage {
    async fn append_or_update_instance(
        &mut self,
        id: InstanceId,
        view: View,
        value: Option<&Bytes>,
        decided: bool,
    ) -> PaxosResult<()> {
        let record = encode_record(&StoredInstance {
            id,
            view,
            value: value.cloned(),
            decided,
        });
        let file = self.log_file().await?;
        file.write_all(&record).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn read_log(&mut self) -> PaxosResult<Vec<StoredInstance>> {
        let data = match self.read_optional(LOG_PATH).await? {
            None => return Ok(Vec::new()),
            Some(data) => data,
        };
        let mut reader = Reader::new(Bytes::from(data));
        let mut latest = BTreeMap::new();
        while !reader.is_empty() {
            match decode_record(&mut reader) {
                Ok(record) => {
                    latest.insert(record.id, record);
                }
                Err(e) => {
                    // Only the tail can be torn, by a crash in the middle of an append.
                    warn!("Ignoring incomplete log record at end of file: {}", e);
                    break;
                }
            }
        }
        debug!(instances = latest.len(), "read persisted log");
        Ok(latest.into_values().collect())
    }

    async fn read_view(&mut self) -> PaxosResult<View> {
        self.read_u64(VIEW_PATH).await
    }

    async fn write_view(&mut self, view: View) -> PaxosResult<()> {
        self.replace_file(VIEW_PATH, &view.to_be_bytes()).await
    }

    async fn read_epoch(&mut self) -> PaxosResult<u64> {
        self.read_u64(EPOCH_PATH).await
    }

    async fn write_epoch(&mut self, epoch: u64) -> PaxosResult<()> {
        self.replace_file(EPOCH_PATH, &epoch.to_be_bytes()).await
    }

    async fn write_snapshot(&mut self, snapshot: &Snapshot) -> PaxosResult<()> {
        self.replace_file(SNAPSHOT_PATH, &snapshot.encode()).await?;

        // Rewrite the log without the instances the snapshot covers.
        let retained: Vec<StoredInstance> = self
            .read_log()
            .await?
            .into_iter()
            .filter(|r| r.id >= snapshot.next_instance_id)
            .collect();
        let mut buf = BytesMut::new();
        for record in &retained {
            buf.put_slice(&encode_record(record));
        }
        self.log = None;
        self.replace_file(LOG_PATH, &buf).await?;
        debug!(
            next_instance = snapshot.next_instance_id,
            retained = retained.len(),
            "persisted snapshot"
        );
        Ok(())
    }

    async fn read_snapshot(&mut self) -> PaxosResult<Option<Snapshot>> {
        match self.read_optional(SNAPSHOT_PATH).await? {
            None => Ok(None),
            Some(data) => Ok(Some(Snapshot::decode(Bytes::from(data))?)),
        }
    }
}

fn encode_record(record: &StoredInstance) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u64(record.id);
    buf.put_u64(record.view);
    let mut flags = 0;
    if record.decided {
        flags |= FLAG_DECIDED;
    }
    if record.value.is_some() {
        flags |= FLAG_HAS_VALUE;
    }
    buf.put_u8(flags);
    if let Some(value) = &record.value {
        put_bytes(&mut buf, value);
    }
    buf.freeze()
}

fn decode_record(reader: &mut Reader) -> PaxosResult<StoredInstance> {
    let id = reader.u64("log record")?;
    let view = reader.u64("log record")?;
    let flags = reader.u8("log record")?;
    let value = if flags & FLAG_HAS_VALUE != 0 {
        Some(reader.bytes("log record value")?)
    } else {
        None
    };
    Ok(StoredInstance {
        id,
        view,
        value,
        decided: flags & FLAG_DECIDED != 0,
    })
}

async fn create_dir_if_not_exists(directory: &str) -> PaxosResult<()> {
    let dir_path = Path::new(directory);
    match fs::metadata(&dir_path).await {
        Ok(metadata) => {
            if metadata.is_dir() {
                Ok(())
            } else {
                Err(PaxosError::Initialization(format!(
                    "Path exists but is not a directory: {}",
                    directory
                )))
            }
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(fs::create_dir_all(directory).await?),
        Err(e) => Err(e.into()),
    }
}
