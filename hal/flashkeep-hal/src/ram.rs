//! In-memory flash record service
//!
//! `RamFlash` implements [`FlashStorageService`] on RAM with the same
//! bookkeeping a wear-leveled store has: every record costs a header plus
//! its payload words, updates and deletions leave dirty space behind that
//! only garbage collection reclaims, and submitted requests stay queued
//! until [`RamFlash::complete_next`] runs them.
//!
//! Host tests use it to step through completions one at a time and to
//! inject faults.

use heapless::{Deque, Vec};

use crate::flash::{
    record_words, FileId, FlashError, FlashEvent, FlashOp, FlashResult, FlashStorageService,
    FsStat, RecordDescriptor, RecordKey, MAX_RECORD_LEN,
};

/// Result code used when a queued request refers to a record that is gone
pub const RESULT_INVALID_DESCRIPTOR: u16 = 0x0A;

/// A submitted request waiting for completion
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Request {
    Init,
    Write {
        record: RecordKey,
        data: Vec<u8, MAX_RECORD_LEN>,
    },
    Update {
        descriptor: RecordDescriptor,
        data: Vec<u8, MAX_RECORD_LEN>,
    },
    DeleteRecord {
        descriptor: RecordDescriptor,
    },
    DeleteFile {
        file_id: FileId,
    },
    GarbageCollect,
}

impl Request {
    /// The operation kind of this request
    pub fn op(&self) -> FlashOp {
        match self {
            Request::Init => FlashOp::Init,
            Request::Write { .. } => FlashOp::Write,
            Request::Update { .. } => FlashOp::Update,
            Request::DeleteRecord { .. } => FlashOp::DeleteRecord,
            Request::DeleteFile { .. } => FlashOp::DeleteFile,
            Request::GarbageCollect => FlashOp::GarbageCollect,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    descriptor: RecordDescriptor,
    record: RecordKey,
    data: Vec<u8, MAX_RECORD_LEN>,
}

impl StoredRecord {
    fn words(&self) -> u32 {
        record_words(self.data.len())
    }
}

/// RAM backed record service
///
/// `RECORDS` bounds the number of live records, `QUEUE` the number of
/// requests that may be submitted before completion.
#[derive(Debug)]
pub struct RamFlash<const RECORDS: usize, const QUEUE: usize> {
    records: Vec<StoredRecord, RECORDS>,
    open: Vec<RecordDescriptor, RECORDS>,
    requests: Deque<Request, QUEUE>,
    events: Deque<FlashEvent, QUEUE>,
    capacity_words: u32,
    dirty_words: u32,
    dirty_records: u16,
    next_descriptor: u32,
    initialized: bool,
    handler_registered: bool,
    submit_fault: Option<FlashError>,
    completion_fault: Option<FlashResult>,
    submitted: u32,
    max_outstanding: usize,
}

impl<const RECORDS: usize, const QUEUE: usize> RamFlash<RECORDS, QUEUE> {
    /// Create an unformatted store of `capacity_words` words
    ///
    /// The coordinator has to run the one-time initialization before
    /// records can be found.
    pub fn new(capacity_words: u32) -> Self {
        Self {
            records: Vec::new(),
            open: Vec::new(),
            requests: Deque::new(),
            events: Deque::new(),
            capacity_words,
            dirty_words: 0,
            dirty_records: 0,
            next_descriptor: 1,
            initialized: false,
            handler_registered: false,
            submit_fault: None,
            completion_fault: None,
            submitted: 0,
            max_outstanding: 0,
        }
    }

    /// Create a store that reports itself as already initialized
    pub fn formatted(capacity_words: u32) -> Self {
        let mut flash = Self::new(capacity_words);
        flash.initialized = true;
        flash
    }

    /// Fail the next submission with `error` before it is queued
    pub fn fail_next_submit(&mut self, error: FlashError) {
        self.submit_fault = Some(error);
    }

    /// Complete the next request with `result` without applying it
    pub fn fail_next_completion(&mut self, result: FlashResult) {
        self.completion_fault = Some(result);
    }

    /// Requests submitted but not yet completed
    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    /// Highest number of simultaneously outstanding requests seen
    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding
    }

    /// Total requests accepted since creation
    pub fn submitted(&self) -> u32 {
        self.submitted
    }

    /// Next request that [`complete_next`](Self::complete_next) will run
    pub fn peek(&self) -> Option<&Request> {
        self.requests.front()
    }

    /// Payload currently stored for `record`
    pub fn data(&self, record: RecordKey) -> Option<&[u8]> {
        self.records
            .iter()
            .find(|r| r.record == record)
            .map(|r| r.data.as_slice())
    }

    /// Record identity behind a descriptor
    pub fn resolve(&self, descriptor: RecordDescriptor) -> Option<RecordKey> {
        self.records
            .iter()
            .find(|r| r.descriptor == descriptor)
            .map(|r| r.record)
    }

    /// Run the oldest queued request and queue its completion event
    ///
    /// Returns the produced event. The event is only delivered through
    /// [`poll_event`](FlashStorageService::poll_event) once an event handler
    /// has been registered.
    pub fn complete_next(&mut self) -> Option<FlashEvent> {
        if self.handler_registered && self.events.is_full() {
            return None;
        }
        let request = self.requests.pop_front()?;
        let event = match self.completion_fault.take() {
            Some(result) => Self::failed_event(&request, result, self.resolve_request(&request)),
            None => self.apply(request),
        };
        if self.handler_registered {
            // Capacity was checked above
            let _ = self.events.push_back(event);
        }
        Some(event)
    }

    /// Complete every queued request
    pub fn complete_all(&mut self) -> usize {
        let mut count = 0;
        while self.complete_next().is_some() {
            count += 1;
        }
        count
    }

    fn used_words(&self) -> u32 {
        self.records.iter().map(StoredRecord::words).sum::<u32>() + self.dirty_words
    }

    fn free_words(&self) -> u32 {
        self.capacity_words.saturating_sub(self.used_words())
    }

    fn allocate_descriptor(&mut self) -> RecordDescriptor {
        let descriptor = RecordDescriptor::new(self.next_descriptor);
        self.next_descriptor = self.next_descriptor.wrapping_add(1).max(1);
        descriptor
    }

    fn index_of(&self, descriptor: RecordDescriptor) -> Option<usize> {
        self.records.iter().position(|r| r.descriptor == descriptor)
    }

    fn resolve_request(&self, request: &Request) -> Option<RecordKey> {
        match request {
            Request::Write { record, .. } => Some(*record),
            Request::Update { descriptor, .. } | Request::DeleteRecord { descriptor } => {
                self.resolve(*descriptor)
            }
            _ => None,
        }
    }

    fn failed_event(request: &Request, result: FlashResult, record: Option<RecordKey>) -> FlashEvent {
        let record = record.unwrap_or(RecordKey::new(FileId::Application, 0));
        match request {
            Request::Init => FlashEvent::Init { result },
            Request::Write { .. } => FlashEvent::Write {
                result,
                record,
                descriptor: RecordDescriptor::new(0),
            },
            Request::Update { descriptor, .. } => FlashEvent::Update {
                result,
                record,
                descriptor: *descriptor,
            },
            Request::DeleteRecord { .. } => FlashEvent::DeleteRecord { result, record },
            Request::DeleteFile { file_id } => FlashEvent::DeleteFile {
                result,
                file_id: *file_id,
            },
            Request::GarbageCollect => FlashEvent::GarbageCollect { result },
        }
    }

    fn mark_dirty(&mut self, words: u32) {
        self.dirty_words += words;
        self.dirty_records = self.dirty_records.saturating_add(1);
    }

    fn apply(&mut self, request: Request) -> FlashEvent {
        match request {
            Request::Init => {
                self.initialized = true;
                FlashEvent::Init {
                    result: FlashResult::Success,
                }
            }
            Request::Write { record, data } => {
                if record_words(data.len()) > self.free_words() || self.records.is_full() {
                    return FlashEvent::Write {
                        result: FlashResult::NoSpaceInFlash,
                        record,
                        descriptor: RecordDescriptor::new(0),
                    };
                }
                let descriptor = self.allocate_descriptor();
                // Fullness was checked above
                let _ = self.records.push(StoredRecord {
                    descriptor,
                    record,
                    data,
                });
                FlashEvent::Write {
                    result: FlashResult::Success,
                    record,
                    descriptor,
                }
            }
            Request::Update { descriptor, data } => {
                let Some(index) = self.index_of(descriptor) else {
                    return Self::failed_event(
                        &Request::Update { descriptor, data },
                        FlashResult::Other(RESULT_INVALID_DESCRIPTOR),
                        None,
                    );
                };
                let record = self.records[index].record;
                // The new copy is written before the old one is invalidated
                if record_words(data.len()) > self.free_words() {
                    return FlashEvent::Update {
                        result: FlashResult::NoSpaceInFlash,
                        record,
                        descriptor,
                    };
                }
                let old_words = self.records[index].words();
                self.mark_dirty(old_words);
                let new_descriptor = self.allocate_descriptor();
                let stored = &mut self.records[index];
                stored.data = data;
                stored.descriptor = new_descriptor;
                FlashEvent::Update {
                    result: FlashResult::Success,
                    record,
                    descriptor: new_descriptor,
                }
            }
            Request::DeleteRecord { descriptor } => match self.index_of(descriptor) {
                Some(index) => {
                    let removed = self.records.swap_remove(index);
                    self.mark_dirty(removed.words());
                    FlashEvent::DeleteRecord {
                        result: FlashResult::Success,
                        record: removed.record,
                    }
                }
                None => Self::failed_event(
                    &Request::DeleteRecord { descriptor },
                    FlashResult::Other(RESULT_INVALID_DESCRIPTOR),
                    None,
                ),
            },
            Request::DeleteFile { file_id } => {
                while let Some(index) = self.records.iter().position(|r| r.record.file_id == file_id) {
                    let removed = self.records.swap_remove(index);
                    self.mark_dirty(removed.words());
                }
                FlashEvent::DeleteFile {
                    result: FlashResult::Success,
                    file_id,
                }
            }
            Request::GarbageCollect => {
                self.dirty_words = 0;
                self.dirty_records = 0;
                FlashEvent::GarbageCollect {
                    result: FlashResult::Success,
                }
            }
        }
    }

    fn submit(&mut self, request: Request) -> Result<(), FlashError> {
        if let Some(error) = self.submit_fault.take() {
            return Err(error);
        }
        self.requests
            .push_back(request)
            .map_err(|_| FlashError::NoSpaceInQueues)?;
        self.submitted += 1;
        self.max_outstanding = self.max_outstanding.max(self.requests.len());
        Ok(())
    }

    fn copy_payload(data: &[u8]) -> Result<Vec<u8, MAX_RECORD_LEN>, FlashError> {
        Vec::from_slice(data).map_err(|_| FlashError::RecordTooLarge)
    }

    fn require_initialized(&self) -> Result<(), FlashError> {
        if self.initialized {
            Ok(())
        } else {
            Err(FlashError::NotInitialized)
        }
    }
}

impl<const RECORDS: usize, const QUEUE: usize> FlashStorageService for RamFlash<RECORDS, QUEUE> {
    fn register_event_handler(&mut self) -> Result<(), FlashError> {
        self.handler_registered = true;
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn init(&mut self) -> Result<(), FlashError> {
        self.submit(Request::Init)
    }

    fn stat(&self) -> FsStat {
        FsStat {
            open_records: self.open.len() as u16,
            valid_records: self.records.len() as u16,
            dirty_records: self.dirty_records,
            reserved_words: 0,
            used_words: self.used_words(),
            largest_contiguous: self.free_words(),
            freeable_words: self.dirty_words,
        }
    }

    fn find(&mut self, record: RecordKey) -> Result<RecordDescriptor, FlashError> {
        self.require_initialized()?;
        self.records
            .iter()
            .find(|r| r.record == record)
            .map(|r| r.descriptor)
            .ok_or(FlashError::NotFound)
    }

    fn open(&mut self, descriptor: RecordDescriptor) -> Result<&[u8], FlashError> {
        let index = self
            .index_of(descriptor)
            .ok_or(FlashError::InvalidDescriptor)?;
        if !self.open.contains(&descriptor) {
            self.open
                .push(descriptor)
                .map_err(|_| FlashError::Other(RESULT_INVALID_DESCRIPTOR))?;
        }
        Ok(self.records[index].data.as_slice())
    }

    fn close(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError> {
        let index = self
            .open
            .iter()
            .position(|d| *d == descriptor)
            .ok_or(FlashError::InvalidDescriptor)?;
        self.open.swap_remove(index);
        Ok(())
    }

    fn write(&mut self, record: RecordKey, data: &[u8]) -> Result<(), FlashError> {
        self.require_initialized()?;
        let data = Self::copy_payload(data)?;
        self.submit(Request::Write { record, data })
    }

    fn update(&mut self, descriptor: RecordDescriptor, data: &[u8]) -> Result<(), FlashError> {
        self.require_initialized()?;
        let data = Self::copy_payload(data)?;
        self.submit(Request::Update { descriptor, data })
    }

    fn delete_record(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError> {
        self.require_initialized()?;
        self.submit(Request::DeleteRecord { descriptor })
    }

    fn delete_file(&mut self, file_id: FileId) -> Result<(), FlashError> {
        self.require_initialized()?;
        self.submit(Request::DeleteFile { file_id })
    }

    fn garbage_collect(&mut self) -> Result<(), FlashError> {
        self.require_initialized()?;
        self.submit(Request::GarbageCollect)
    }

    fn poll_event(&mut self) -> Option<FlashEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Flash = RamFlash<8, 4>;

    const CAL: RecordKey = RecordKey::new(FileId::Calibration, 1);

    fn ready() -> Flash {
        let mut flash = Flash::formatted(64);
        flash.register_event_handler().unwrap();
        flash
    }

    #[test]
    fn test_init_completes_asynchronously() {
        let mut flash = Flash::new(64);
        flash.register_event_handler().unwrap();
        assert!(!flash.is_initialized());
        assert_eq!(flash.find(CAL), Err(FlashError::NotInitialized));

        flash.init().unwrap();
        assert!(!flash.is_initialized());
        assert!(flash.poll_event().is_none());

        flash.complete_next();
        assert!(flash.is_initialized());
        assert_eq!(
            flash.poll_event(),
            Some(FlashEvent::Init {
                result: FlashResult::Success
            })
        );
    }

    #[test]
    fn test_write_then_open() {
        let mut flash = ready();
        flash.write(CAL, &[1, 2, 3]).unwrap();
        assert_eq!(flash.find(CAL), Err(FlashError::NotFound));

        let event = flash.complete_next().unwrap();
        let FlashEvent::Write { result, record, descriptor } = event else {
            panic!("unexpected event {:?}", event);
        };
        assert_eq!(result, FlashResult::Success);
        assert_eq!(record, CAL);

        assert_eq!(flash.find(CAL), Ok(descriptor));
        assert_eq!(flash.open(descriptor).unwrap(), &[1, 2, 3]);
        assert_eq!(flash.stat().open_records, 1);
        flash.close(descriptor).unwrap();
        assert_eq!(flash.stat().open_records, 0);
        assert_eq!(flash.close(descriptor), Err(FlashError::InvalidDescriptor));
    }

    #[test]
    fn test_queue_exhaustion() {
        let mut flash = ready();
        for key in 1..=4 {
            flash.write(RecordKey::new(FileId::Counters, key), &[0]).unwrap();
        }
        assert_eq!(
            flash.write(RecordKey::new(FileId::Counters, 5), &[0]),
            Err(FlashError::NoSpaceInQueues)
        );
        assert_eq!(flash.max_outstanding(), 4);
    }

    #[test]
    fn test_update_leaves_dirty_space_until_gc() {
        let mut flash = ready();
        flash.write(CAL, &[0; 8]).unwrap();
        flash.complete_next();
        let descriptor = flash.find(CAL).unwrap();

        flash.update(descriptor, &[1; 8]).unwrap();
        flash.complete_next();
        let stat = flash.stat();
        assert_eq!(stat.valid_records, 1);
        assert_eq!(stat.dirty_records, 1);
        assert_eq!(stat.freeable_words, record_words(8));
        assert_eq!(stat.used_words, 2 * record_words(8));
        assert_eq!(flash.data(CAL), Some(&[1u8; 8][..]));

        flash.garbage_collect().unwrap();
        flash.complete_next();
        let stat = flash.stat();
        assert_eq!(stat.freeable_words, 0);
        assert_eq!(stat.used_words, record_words(8));
    }

    #[test]
    fn test_write_reports_full_flash() {
        // Room for exactly one 8 byte record
        let mut flash: Flash = RamFlash::formatted(record_words(8));
        flash.register_event_handler().unwrap();
        flash.write(CAL, &[0; 8]).unwrap();
        flash.write(RecordKey::new(FileId::Calibration, 2), &[0; 8]).unwrap();
        flash.complete_all();

        assert!(flash.poll_event().unwrap().result().is_success());
        assert_eq!(
            flash.poll_event().unwrap().result(),
            FlashResult::NoSpaceInFlash
        );
    }

    #[test]
    fn test_delete_file_removes_only_that_file() {
        let mut flash = ready();
        flash.write(RecordKey::new(FileId::Sensor, 1), &[1]).unwrap();
        flash.write(RecordKey::new(FileId::Led, 2), &[2]).unwrap();
        flash.write(RecordKey::new(FileId::Sensor, 3), &[3]).unwrap();
        flash.complete_all();

        flash.delete_file(FileId::Sensor).unwrap();
        flash.complete_all();
        assert!(flash.data(RecordKey::new(FileId::Sensor, 1)).is_none());
        assert!(flash.data(RecordKey::new(FileId::Sensor, 3)).is_none());
        assert_eq!(flash.data(RecordKey::new(FileId::Led, 2)), Some(&[2u8][..]));
        assert_eq!(flash.stat().dirty_records, 2);
    }

    #[test]
    fn test_fault_injection() {
        let mut flash = ready();
        flash.fail_next_submit(FlashError::Busy);
        assert_eq!(flash.garbage_collect(), Err(FlashError::Busy));
        assert_eq!(flash.outstanding(), 0);

        flash.write(CAL, &[7]).unwrap();
        flash.fail_next_completion(FlashResult::Other(3));
        let event = flash.complete_next().unwrap();
        assert_eq!(event.result(), FlashResult::Other(3));
        assert!(flash.data(CAL).is_none());
    }

    #[test]
    fn test_events_need_registered_handler() {
        let mut flash = Flash::formatted(64);
        flash.write(CAL, &[7]).unwrap();
        assert!(flash.complete_next().is_some());
        assert!(flash.poll_event().is_none());
        assert!(flash.data(CAL).is_some());
    }

    #[test]
    fn test_oversized_record_rejected() {
        let mut flash = ready();
        let big = [0u8; MAX_RECORD_LEN + 1];
        assert_eq!(flash.write(CAL, &big), Err(FlashError::RecordTooLarge));
    }
}
