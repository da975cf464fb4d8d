//! Flash record service abstractions
//!
//! Provides the types and the trait through which the persistence
//! coordinator talks to a wear-leveled record store.

/// Largest record payload a service accepts, in bytes
pub const MAX_RECORD_LEN: usize = 256;

/// Words of bookkeeping stored in front of every record
pub const RECORD_HEADER_WORDS: u32 = 3;

/// Known record categories
///
/// File identifiers group records into logical categories. Only the
/// identifiers listed here are accepted by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum FileId {
    /// Device configuration
    Configuration = 1,
    /// Sensor and actuator calibration
    Calibration = 2,
    /// Monotonic counters (boot count, cycle count)
    Counters = 3,
    /// Pairing and bonding data
    Bonding = 4,
    /// Sensor sampling state
    Sensor = 5,
    /// Battery monitoring state
    Battery = 6,
    /// LED patterns and brightness
    Led = 7,
    /// Application defined state
    Application = 10,
}

impl FileId {
    /// Every known category, in identifier order
    pub const ALL: [FileId; 8] = [
        FileId::Configuration,
        FileId::Calibration,
        FileId::Counters,
        FileId::Bonding,
        FileId::Sensor,
        FileId::Battery,
        FileId::Led,
        FileId::Application,
    ];

    /// Get the identifier as a raw value
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Validate a raw identifier against the known-category table
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(FileId::Configuration),
            2 => Some(FileId::Calibration),
            3 => Some(FileId::Counters),
            4 => Some(FileId::Bonding),
            5 => Some(FileId::Sensor),
            6 => Some(FileId::Battery),
            7 => Some(FileId::Led),
            10 => Some(FileId::Application),
            _ => None,
        }
    }
}

/// Identity of one record: `(file identifier, key)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordKey {
    /// Record category
    pub file_id: FileId,
    /// Key unique within the process lifetime
    pub key: u16,
}

impl RecordKey {
    /// Create a record identity
    pub const fn new(file_id: FileId, key: u16) -> Self {
        Self { file_id, key }
    }

    /// Pack into a single word (file identifier in the high half)
    pub fn packed(self) -> u32 {
        ((self.file_id.as_u16() as u32) << 16) | self.key as u32
    }

    /// Unpack a word produced by [`RecordKey::packed`]
    pub fn from_packed(value: u32) -> Option<Self> {
        let file_id = FileId::from_u16((value >> 16) as u16)?;
        Some(Self::new(file_id, value as u16))
    }
}

/// Opaque handle to a located or created record
///
/// Returned by [`FlashStorageService::find`] and carried in write/update
/// completions; used for subsequent open, update and delete calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordDescriptor(u32);

impl RecordDescriptor {
    /// Wrap a service specific handle value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw handle value
    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Storage usage as reported by the service
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FsStat {
    /// Records currently open for reading
    pub open_records: u16,
    /// Live records
    pub valid_records: u16,
    /// Deleted or superseded records awaiting garbage collection
    pub dirty_records: u16,
    /// Words reserved for queued writes
    pub reserved_words: u32,
    /// Words occupied by valid and dirty records
    pub used_words: u32,
    /// Largest write (in words) that fits without garbage collection
    pub largest_contiguous: u32,
    /// Words a garbage collection would reclaim
    pub freeable_words: u32,
}

/// Kinds of asynchronous operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashOp {
    /// One-time storage initialization
    Init,
    /// Create a new record
    Write,
    /// Replace an existing record
    Update,
    /// Delete one record
    DeleteRecord,
    /// Delete every record of a file
    DeleteFile,
    /// Reclaim dirty space
    GarbageCollect,
}

/// Result code carried by a completion event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashResult {
    /// Operation completed
    Success,
    /// Service was busy; the operation had no effect
    Busy,
    /// Internal queue was full; the operation had no effect
    NoSpaceInQueues,
    /// Flash region is full; garbage collection may help
    NoSpaceInFlash,
    /// Any other service specific code
    Other(u16),
}

impl FlashResult {
    /// Check if the result reports success
    pub fn is_success(self) -> bool {
        matches!(self, FlashResult::Success)
    }
}

/// Completion event for an asynchronous operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashEvent {
    /// Storage initialization finished
    Init { result: FlashResult },
    /// Record creation finished
    Write {
        result: FlashResult,
        record: RecordKey,
        descriptor: RecordDescriptor,
    },
    /// Record replacement finished
    Update {
        result: FlashResult,
        record: RecordKey,
        descriptor: RecordDescriptor,
    },
    /// Record deletion finished
    DeleteRecord {
        result: FlashResult,
        record: RecordKey,
    },
    /// File deletion finished
    DeleteFile { result: FlashResult, file_id: FileId },
    /// Garbage collection finished
    GarbageCollect { result: FlashResult },
}

impl FlashEvent {
    /// The operation this event completes
    pub fn op(&self) -> FlashOp {
        match self {
            FlashEvent::Init { .. } => FlashOp::Init,
            FlashEvent::Write { .. } => FlashOp::Write,
            FlashEvent::Update { .. } => FlashOp::Update,
            FlashEvent::DeleteRecord { .. } => FlashOp::DeleteRecord,
            FlashEvent::DeleteFile { .. } => FlashOp::DeleteFile,
            FlashEvent::GarbageCollect { .. } => FlashOp::GarbageCollect,
        }
    }

    /// The result code of the operation
    pub fn result(&self) -> FlashResult {
        match *self {
            FlashEvent::Init { result }
            | FlashEvent::Write { result, .. }
            | FlashEvent::Update { result, .. }
            | FlashEvent::DeleteRecord { result, .. }
            | FlashEvent::DeleteFile { result, .. }
            | FlashEvent::GarbageCollect { result } => result,
        }
    }
}

/// Errors reported synchronously by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashError {
    /// No record with the requested identity
    NotFound,
    /// Request queue is full, try again later
    NoSpaceInQueues,
    /// Flash region is full
    NoSpaceInFlash,
    /// Service is busy
    Busy,
    /// Record payload exceeds [`MAX_RECORD_LEN`]
    RecordTooLarge,
    /// Descriptor does not refer to a live record
    InvalidDescriptor,
    /// Storage has not been initialized
    NotInitialized,
    /// Underlying storage failed
    Storage,
    /// Any other service specific code
    Other(u16),
}

/// Words a record of `len` payload bytes occupies, header included
pub fn record_words(len: usize) -> u32 {
    RECORD_HEADER_WORDS + len.div_ceil(4) as u32
}

/// Flash record service
///
/// Lookups (`find`, `open`, `close`, `stat`) are synchronous. Mutations
/// (`init`, `write`, `update`, `delete_record`, `delete_file`,
/// `garbage_collect`) only submit a request: an `Ok` return means the request
/// was accepted, its outcome arrives later as a [`FlashEvent`] from
/// [`poll_event`](FlashStorageService::poll_event).
///
/// Implementations copy submitted data, so callers do not need to keep their
/// buffers alive until completion.
pub trait FlashStorageService {
    /// Start queueing completion events for the caller
    fn register_event_handler(&mut self) -> Result<(), FlashError>;

    /// Check if the one-time storage initialization already happened
    fn is_initialized(&self) -> bool;

    /// Submit the one-time storage initialization
    fn init(&mut self) -> Result<(), FlashError>;

    /// Report storage usage
    fn stat(&self) -> FsStat;

    /// Locate a record
    fn find(&mut self, record: RecordKey) -> Result<RecordDescriptor, FlashError>;

    /// Open a located record and borrow its payload
    fn open(&mut self, descriptor: RecordDescriptor) -> Result<&[u8], FlashError>;

    /// Close a record opened with [`open`](FlashStorageService::open)
    fn close(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError>;

    /// Submit creation of a new record
    fn write(&mut self, record: RecordKey, data: &[u8]) -> Result<(), FlashError>;

    /// Submit replacement of an existing record's payload
    fn update(&mut self, descriptor: RecordDescriptor, data: &[u8]) -> Result<(), FlashError>;

    /// Submit deletion of one record
    fn delete_record(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError>;

    /// Submit deletion of every record in a file
    fn delete_file(&mut self, file_id: FileId) -> Result<(), FlashError>;

    /// Submit garbage collection
    fn garbage_collect(&mut self) -> Result<(), FlashError>;

    /// Take the next completion event, if any
    fn poll_event(&mut self) -> Option<FlashEvent>;
}

// Implement the sequential-storage Key trait when the feature is enabled
#[cfg(feature = "sequential-storage")]
impl sequential_storage::map::Key for RecordKey {
    fn serialize_into(
        &self,
        buffer: &mut [u8],
    ) -> Result<usize, sequential_storage::map::SerializationError> {
        if buffer.len() < 4 {
            return Err(sequential_storage::map::SerializationError::BufferTooSmall);
        }
        buffer[..4].copy_from_slice(&self.packed().to_le_bytes());
        Ok(4)
    }

    fn deserialize_from(
        buffer: &[u8],
    ) -> Result<(Self, usize), sequential_storage::map::SerializationError> {
        if buffer.len() < 4 {
            return Err(sequential_storage::map::SerializationError::BufferTooSmall);
        }
        let packed = u32::from_le_bytes([buffer[0], buffer[1], buffer[2], buffer[3]]);
        match RecordKey::from_packed(packed) {
            Some(key) => Ok((key, 4)),
            None => Err(sequential_storage::map::SerializationError::InvalidFormat),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_file_id_table() {
        for id in FileId::ALL {
            assert_eq!(FileId::from_u16(id.as_u16()), Some(id));
        }
        assert_eq!(FileId::from_u16(0), None);
        assert_eq!(FileId::from_u16(8), None);
        assert_eq!(FileId::from_u16(0xFFFF), None);
    }

    #[test]
    fn test_record_words() {
        assert_eq!(record_words(0), RECORD_HEADER_WORDS);
        assert_eq!(record_words(1), RECORD_HEADER_WORDS + 1);
        assert_eq!(record_words(4), RECORD_HEADER_WORDS + 1);
        assert_eq!(record_words(5), RECORD_HEADER_WORDS + 2);
    }

    #[test]
    fn test_event_accessors() {
        let event = FlashEvent::DeleteFile {
            result: FlashResult::Busy,
            file_id: FileId::Led,
        };
        assert_eq!(event.op(), FlashOp::DeleteFile);
        assert_eq!(event.result(), FlashResult::Busy);
        assert!(!event.result().is_success());
    }

    #[test]
    fn test_unknown_file_in_packed_key() {
        assert_eq!(RecordKey::from_packed(0x0009_0001), None);
    }

    proptest! {
        #[test]
        fn packed_key_identifies_record(index in 0usize..FileId::ALL.len(), key in any::<u16>()) {
            let record = RecordKey::new(FileId::ALL[index], key);
            prop_assert_eq!(RecordKey::from_packed(record.packed()), Some(record));
        }
    }
}
