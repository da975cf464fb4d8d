//! Record service on a NOR flash partition
//!
//! Records are sequential-storage map items keyed by [`RecordKey`]. Lookups
//! are answered synchronously by running the map futures to completion with
//! `embassy_futures::block_on`. Mutations are queued and executed one at a
//! time by [`NorFlashService::process`], which produces the completion
//! event. File deletion and usage statistics walk every map item.

use core::ops::Range;

use embedded_storage_async::nor_flash::MultiwriteNorFlash;
use heapless::{Deque, Vec};
use sequential_storage::cache::NoCache;
use sequential_storage::map;

use flashkeep_hal::flash::record_words;
use flashkeep_hal::{
    FileId, FlashError, FlashEvent, FlashResult, FlashStorageService, FsStat, RecordDescriptor,
    RecordKey, MAX_RECORD_LEN,
};

/// Scratch buffer for map items (key + payload + alignment)
const DATA_BUFFER_LEN: usize = 512;

/// Result code for a storage level failure
pub const RESULT_STORAGE: u16 = 0x01;

/// Result code for corrupted map contents
pub const RESULT_CORRUPTED: u16 = 0x02;

/// Key probed during initialization to validate the partition
const PROBE_KEY: RecordKey = RecordKey::new(FileId::Configuration, 0);

/// Partition layout
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NorFlashConfig {
    /// Byte range of the record partition, relative to flash start
    pub range: Range<u32>,
}

impl NorFlashConfig {
    /// Partition occupying the last `partition_size` bytes of a flash of
    /// `flash_size` bytes
    pub const fn tail(flash_size: u32, partition_size: u32) -> Self {
        Self {
            range: (flash_size - partition_size)..flash_size,
        }
    }

    /// Partition size in words
    pub fn words(&self) -> u32 {
        (self.range.end - self.range.start) / 4
    }
}

#[derive(Debug, Clone)]
enum Request {
    Init,
    Write {
        record: RecordKey,
        data: Vec<u8, MAX_RECORD_LEN>,
    },
    Update {
        record: RecordKey,
        data: Vec<u8, MAX_RECORD_LEN>,
    },
    DeleteRecord {
        record: RecordKey,
    },
    DeleteFile {
        file_id: FileId,
    },
    GarbageCollect,
}

/// Record accounting from the last map scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Usage {
    valid_records: u16,
    dirty_records: u16,
    used_words: u32,
    freeable_words: u32,
}

fn descriptor_of(record: RecordKey) -> RecordDescriptor {
    RecordDescriptor::new(record.packed())
}

fn record_of(descriptor: RecordDescriptor) -> Result<RecordKey, FlashError> {
    RecordKey::from_packed(descriptor.raw()).ok_or(FlashError::InvalidDescriptor)
}

fn result_of<E>(error: &sequential_storage::Error<E>) -> FlashResult {
    match error {
        sequential_storage::Error::FullStorage => FlashResult::NoSpaceInFlash,
        sequential_storage::Error::Corrupted { .. } => FlashResult::Other(RESULT_CORRUPTED),
        _ => FlashResult::Other(RESULT_STORAGE),
    }
}

fn error_of<E>(error: &sequential_storage::Error<E>) -> FlashError {
    match result_of(error) {
        FlashResult::NoSpaceInFlash => FlashError::NoSpaceInFlash,
        FlashResult::Other(code) => FlashError::Other(code),
        _ => FlashError::Storage,
    }
}

/// Record service on a NOR flash partition
///
/// `QUEUE` bounds the requests accepted before completion. `RECORDS` bounds
/// the distinct records one map scan keeps track of; `delete_file` scans
/// again until no record of the file is left, and usage beyond the bound
/// counts superseded copies as valid.
///
/// Removing map items clears bits in place, so the flash has to allow
/// multiple writes per word.
pub struct NorFlashService<
    F: MultiwriteNorFlash,
    const QUEUE: usize = 4,
    const RECORDS: usize = 32,
> {
    flash: F,
    config: NorFlashConfig,
    cache: NoCache,
    data_buffer: [u8; DATA_BUFFER_LEN],
    read_buffer: Vec<u8, MAX_RECORD_LEN>,
    opened: Option<RecordDescriptor>,
    usage: Usage,
    requests: Deque<Request, QUEUE>,
    events: Deque<FlashEvent, QUEUE>,
    initialized: bool,
    handler_registered: bool,
}

impl<F: MultiwriteNorFlash, const QUEUE: usize, const RECORDS: usize>
    NorFlashService<F, QUEUE, RECORDS>
{
    /// Create a service on the given partition
    pub fn new(flash: F, config: NorFlashConfig) -> Self {
        Self {
            flash,
            config,
            cache: NoCache::new(),
            data_buffer: [0u8; DATA_BUFFER_LEN],
            read_buffer: Vec::new(),
            opened: None,
            usage: Usage::default(),
            requests: Deque::new(),
            events: Deque::new(),
            initialized: false,
            handler_registered: false,
        }
    }

    /// Get the raw flash for low-level access
    pub fn flash(&mut self) -> &mut F {
        &mut self.flash
    }

    /// Check if requests are waiting for [`process`](Self::process)
    pub fn has_pending(&self) -> bool {
        !self.requests.is_empty()
    }

    /// Execute the oldest queued request
    ///
    /// Returns `false` when nothing was queued.
    pub async fn process(&mut self) -> bool {
        if self.handler_registered && self.events.is_full() {
            return false;
        }
        let Some(request) = self.requests.pop_front() else {
            return false;
        };
        let event = self.execute(request).await;
        debug!("Flash request completed: {:?}", event);
        if self.initialized {
            self.refresh_usage().await;
        }
        if self.handler_registered {
            // Capacity was checked above
            let _ = self.events.push_back(event);
        }
        true
    }

    async fn execute(&mut self, request: Request) -> FlashEvent {
        match request {
            Request::Init => FlashEvent::Init {
                result: self.initialize().await,
            },
            Request::Write { record, data } => FlashEvent::Write {
                result: self.store(record, &data).await,
                record,
                descriptor: descriptor_of(record),
            },
            Request::Update { record, data } => FlashEvent::Update {
                result: self.store(record, &data).await,
                record,
                descriptor: descriptor_of(record),
            },
            Request::DeleteRecord { record } => FlashEvent::DeleteRecord {
                result: self.remove(record).await,
                record,
            },
            Request::DeleteFile { file_id } => FlashEvent::DeleteFile {
                result: self.remove_file(file_id).await,
                file_id,
            },
            // sequential-storage reclaims pages on demand while storing
            Request::GarbageCollect => FlashEvent::GarbageCollect {
                result: FlashResult::Success,
            },
        }
    }

    async fn initialize(&mut self) -> FlashResult {
        let probe = map::fetch_item::<RecordKey, &[u8], _>(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
            &PROBE_KEY,
        )
        .await;

        let result = match probe {
            Ok(_) => FlashResult::Success,
            Err(sequential_storage::Error::Corrupted { .. }) => {
                warn!("Record partition corrupted, erasing");
                match self
                    .flash
                    .erase(self.config.range.start, self.config.range.end)
                    .await
                {
                    Ok(()) => FlashResult::Success,
                    Err(_) => FlashResult::Other(RESULT_STORAGE),
                }
            }
            Err(e) => result_of(&e),
        };
        if result.is_success() {
            self.initialized = true;
        }
        result
    }

    async fn store(&mut self, record: RecordKey, data: &[u8]) -> FlashResult {
        let result = map::store_item(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
            &record,
            &data,
        )
        .await;

        match result {
            Ok(()) => FlashResult::Success,
            Err(e) => result_of(&e),
        }
    }

    async fn remove(&mut self, record: RecordKey) -> FlashResult {
        let result = map::remove_item(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
            &record,
        )
        .await;

        match result {
            Ok(()) => FlashResult::Success,
            Err(e) => result_of(&e),
        }
    }

    /// Remove every stored record of `file_id`, including records written
    /// before boot
    async fn remove_file(&mut self, file_id: FileId) -> FlashResult {
        loop {
            let records = match self.records_of(file_id).await {
                Ok(records) => records,
                Err(result) => return result,
            };
            if records.is_empty() {
                return FlashResult::Success;
            }
            trace!("Removing {} records of {:?}", records.len(), file_id);
            for record in records {
                let result = self.remove(record).await;
                if !result.is_success() {
                    return result;
                }
            }
        }
    }

    /// Distinct stored records of `file_id`, at most `RECORDS` per call
    async fn records_of(
        &mut self,
        file_id: FileId,
    ) -> Result<Vec<RecordKey, RECORDS>, FlashResult> {
        let mut records = Vec::new();
        let mut items = map::fetch_all_items::<RecordKey, _, _>(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
        )
        .await
        .map_err(|e| result_of(&e))?;

        while let Some((record, _)) = items
            .next::<RecordKey, &[u8]>(&mut self.data_buffer)
            .await
            .map_err(|e| result_of(&e))?
        {
            if record.file_id != file_id || records.contains(&record) {
                continue;
            }
            if records.push(record).is_err() {
                break;
            }
        }
        Ok(records)
    }

    /// Walk the map and account for live and superseded items
    ///
    /// The map keeps every stored version of a record until its page is
    /// reclaimed; all but the last are dirty.
    async fn scan(&mut self) -> Result<Usage, FlashResult> {
        let mut usage = Usage::default();
        let mut live: Vec<(RecordKey, u32), RECORDS> = Vec::new();
        let mut items = map::fetch_all_items::<RecordKey, _, _>(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
        )
        .await
        .map_err(|e| result_of(&e))?;

        while let Some((record, data)) = items
            .next::<RecordKey, &[u8]>(&mut self.data_buffer)
            .await
            .map_err(|e| result_of(&e))?
        {
            let words = record_words(data.len());
            usage.used_words += words;
            match live.iter_mut().find(|(r, _)| *r == record) {
                Some((_, current)) => {
                    usage.dirty_records += 1;
                    usage.freeable_words += *current;
                    *current = words;
                }
                None => {
                    usage.valid_records += 1;
                    // Untracked records keep counting as valid
                    let _ = live.push((record, words));
                }
            }
        }
        Ok(usage)
    }

    async fn refresh_usage(&mut self) {
        match self.scan().await {
            Ok(usage) => self.usage = usage,
            Err(result) => warn!("Record scan failed with {:?}", result),
        }
    }

    /// Fetch `record` into the read buffer, returning whether it exists
    fn fetch(&mut self, record: RecordKey) -> Result<bool, FlashError> {
        let fetched = embassy_futures::block_on(map::fetch_item::<RecordKey, &[u8], _>(
            &mut self.flash,
            self.config.range.clone(),
            &mut self.cache,
            &mut self.data_buffer,
            &record,
        ));

        match fetched {
            Ok(Some(data)) => {
                self.read_buffer.clear();
                self.read_buffer
                    .extend_from_slice(data)
                    .map_err(|_| FlashError::RecordTooLarge)?;
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(e) => Err(error_of(&e)),
        }
    }

    fn submit(&mut self, request: Request) -> Result<(), FlashError> {
        if !self.initialized && !matches!(request, Request::Init) {
            return Err(FlashError::NotInitialized);
        }
        self.requests
            .push_back(request)
            .map_err(|_| FlashError::NoSpaceInQueues)
    }

    fn copy_payload(data: &[u8]) -> Result<Vec<u8, MAX_RECORD_LEN>, FlashError> {
        Vec::from_slice(data).map_err(|_| FlashError::RecordTooLarge)
    }
}

impl<F: MultiwriteNorFlash, const QUEUE: usize, const RECORDS: usize> FlashStorageService
    for NorFlashService<F, QUEUE, RECORDS>
{
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
        let reserved_words: u32 = self
            .requests
            .iter()
            .map(|r| match r {
                Request::Write { data, .. } | Request::Update { data, .. } => {
                    record_words(data.len())
                }
                _ => 0,
            })
            .sum();

        let usage = self.usage;
        FsStat {
            open_records: self.opened.is_some() as u16,
            valid_records: usage.valid_records,
            dirty_records: usage.dirty_records,
            reserved_words,
            used_words: usage.used_words,
            largest_contiguous: self
                .config
                .words()
                .saturating_sub(usage.used_words)
                .saturating_sub(reserved_words),
            freeable_words: usage.freeable_words,
        }
    }

    fn find(&mut self, record: RecordKey) -> Result<RecordDescriptor, FlashError> {
        if !self.initialized {
            return Err(FlashError::NotInitialized);
        }
        if self.fetch(record)? {
            Ok(descriptor_of(record))
        } else {
            Err(FlashError::NotFound)
        }
    }

    fn open(&mut self, descriptor: RecordDescriptor) -> Result<&[u8], FlashError> {
        let record = record_of(descriptor)?;
        if !self.fetch(record)? {
            return Err(FlashError::InvalidDescriptor);
        }
        self.opened = Some(descriptor);
        Ok(self.read_buffer.as_slice())
    }

    fn close(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError> {
        if self.opened != Some(descriptor) {
            return Err(FlashError::InvalidDescriptor);
        }
        self.opened = None;
        self.read_buffer.clear();
        Ok(())
    }

    fn write(&mut self, record: RecordKey, data: &[u8]) -> Result<(), FlashError> {
        let data = Self::copy_payload(data)?;
        self.submit(Request::Write { record, data })
    }

    fn update(&mut self, descriptor: RecordDescriptor, data: &[u8]) -> Result<(), FlashError> {
        let record = record_of(descriptor)?;
        let data = Self::copy_payload(data)?;
        self.submit(Request::Update { record, data })
    }

    fn delete_record(&mut self, descriptor: RecordDescriptor) -> Result<(), FlashError> {
        let record = record_of(descriptor)?;
        self.submit(Request::DeleteRecord { record })
    }

    fn delete_file(&mut self, file_id: FileId) -> Result<(), FlashError> {
        self.submit(Request::DeleteFile { file_id })
    }

    fn garbage_collect(&mut self) -> Result<(), FlashError> {
        self.submit(Request::GarbageCollect)
    }

    fn poll_event(&mut self) -> Option<FlashEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embedded_storage_async::nor_flash::{
        ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash,
    };
    use flashkeep_hal::RECORD_HEADER_WORDS;

    const PAGE: usize = 4096;
    const PAGES: usize = 4;

    #[derive(Debug)]
    struct MemFlashError;

    impl NorFlashError for MemFlashError {
        fn kind(&self) -> NorFlashErrorKind {
            NorFlashErrorKind::Other
        }
    }

    /// NOR semantics in RAM: erase sets bytes to 0xFF, writes only clear bits
    #[derive(Clone)]
    struct MemFlash {
        bytes: [u8; PAGE * PAGES],
    }

    impl MemFlash {
        fn new() -> Self {
            Self {
                bytes: [0xFF; PAGE * PAGES],
            }
        }
    }

    impl ErrorType for MemFlash {
        type Error = MemFlashError;
    }

    impl ReadNorFlash for MemFlash {
        const READ_SIZE: usize = 1;

        async fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.bytes.len() {
                return Err(MemFlashError);
            }
            bytes.copy_from_slice(&self.bytes[start..end]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.bytes.len()
        }
    }

    impl NorFlash for MemFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = PAGE;

        async fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            let (from, to) = (from as usize, to as usize);
            if to > self.bytes.len() || from % PAGE != 0 || to % PAGE != 0 {
                return Err(MemFlashError);
            }
            self.bytes[from..to].fill(0xFF);
            Ok(())
        }

        async fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let start = offset as usize;
            let end = start + bytes.len();
            if end > self.bytes.len() {
                return Err(MemFlashError);
            }
            for (cell, byte) in self.bytes[start..end].iter_mut().zip(bytes) {
                *cell &= *byte;
            }
            Ok(())
        }
    }

    impl MultiwriteNorFlash for MemFlash {}

    type Service = NorFlashService<MemFlash, 4, 8>;

    const CAL: RecordKey = RecordKey::new(FileId::Calibration, 1);

    fn ready() -> Service {
        boot(MemFlash::new())
    }

    /// Bring up a service on existing flash contents
    fn boot(flash: MemFlash) -> Service {
        let size = (PAGE * PAGES) as u32;
        let mut service = Service::new(flash, NorFlashConfig::tail(size, size));
        service.register_event_handler().unwrap();
        service.init().unwrap();
        assert!(block_on(service.process()));
        assert_eq!(
            service.poll_event(),
            Some(FlashEvent::Init {
                result: FlashResult::Success
            })
        );
        service
    }

    fn store(service: &mut Service, record: RecordKey, data: &[u8]) {
        service.write(record, data).unwrap();
        assert!(block_on(service.process()));
        assert_eq!(service.poll_event().unwrap().result(), FlashResult::Success);
    }

    #[test]
    fn test_requests_rejected_before_init() {
        let mut service = Service::new(MemFlash::new(), NorFlashConfig::tail(16384, 16384));
        assert_eq!(service.write(CAL, &[1]), Err(FlashError::NotInitialized));
        assert_eq!(service.find(CAL), Err(FlashError::NotInitialized));
        assert!(!service.has_pending());
    }

    #[test]
    fn test_write_find_open_close() {
        let mut service = ready();
        assert_eq!(service.find(CAL), Err(FlashError::NotFound));

        service.write(CAL, &[9, 8, 7]).unwrap();
        assert!(service.has_pending());
        assert!(block_on(service.process()));
        let event = service.poll_event().unwrap();
        assert_eq!(event.result(), FlashResult::Success);

        let descriptor = service.find(CAL).unwrap();
        assert_eq!(service.open(descriptor).unwrap(), &[9, 8, 7]);
        assert_eq!(service.stat().open_records, 1);
        service.close(descriptor).unwrap();
        assert_eq!(service.stat().open_records, 0);
    }

    #[test]
    fn test_delete_file_removes_file_records() {
        let mut service = ready();
        let a = RecordKey::new(FileId::Sensor, 1);
        let b = RecordKey::new(FileId::Sensor, 3);
        let other = RecordKey::new(FileId::Led, 2);
        for record in [a, other, b] {
            service.write(record, &[record.key as u8]).unwrap();
            block_on(service.process());
        }
        while service.poll_event().is_some() {}

        service.delete_file(FileId::Sensor).unwrap();
        block_on(service.process());
        assert_eq!(
            service.poll_event(),
            Some(FlashEvent::DeleteFile {
                result: FlashResult::Success,
                file_id: FileId::Sensor
            })
        );
        assert_eq!(service.find(a), Err(FlashError::NotFound));
        assert_eq!(service.find(b), Err(FlashError::NotFound));
        assert!(service.find(other).is_ok());
    }

    #[test]
    fn test_delete_file_after_reboot() {
        let a = RecordKey::new(FileId::Sensor, 1);
        let b = RecordKey::new(FileId::Sensor, 3);
        let other = RecordKey::new(FileId::Led, 2);
        let mut before = ready();
        for record in [a, other, b] {
            store(&mut before, record, &[record.key as u8]);
        }

        // A fresh service has located none of these records yet
        let mut service = boot(before.flash().clone());
        assert_eq!(service.stat().valid_records, 3);
        service.delete_file(FileId::Sensor).unwrap();
        assert!(block_on(service.process()));
        assert_eq!(
            service.poll_event(),
            Some(FlashEvent::DeleteFile {
                result: FlashResult::Success,
                file_id: FileId::Sensor
            })
        );
        assert_eq!(service.find(a), Err(FlashError::NotFound));
        assert_eq!(service.find(b), Err(FlashError::NotFound));
        assert!(service.find(other).is_ok());
        assert_eq!(service.stat().valid_records, 1);
    }

    #[test]
    fn test_delete_file_larger_than_one_scan() {
        let mut service = ready();
        // Twice the records one scan keeps track of
        for key in 1..=16 {
            store(&mut service, RecordKey::new(FileId::Sensor, key), &[key as u8]);
        }
        store(&mut service, CAL, &[1]);

        service.delete_file(FileId::Sensor).unwrap();
        assert!(block_on(service.process()));
        assert_eq!(service.poll_event().unwrap().result(), FlashResult::Success);
        for key in 1..=16 {
            assert_eq!(
                service.find(RecordKey::new(FileId::Sensor, key)),
                Err(FlashError::NotFound)
            );
        }
        assert!(service.find(CAL).is_ok());
    }

    #[test]
    fn test_stat_counts_superseded_records() {
        let mut service = ready();
        let stat = service.stat();
        assert_eq!((stat.valid_records, stat.used_words), (0, 0));

        store(&mut service, CAL, &[1, 2, 3]);
        store(&mut service, CAL, &[4, 5, 6, 7, 8]);

        let old = RECORD_HEADER_WORDS + 1;
        let new = RECORD_HEADER_WORDS + 2;
        let stat = service.stat();
        assert_eq!(stat.valid_records, 1);
        assert_eq!(stat.dirty_records, 1);
        assert_eq!(stat.used_words, old + new);
        assert_eq!(stat.freeable_words, old);
        assert_eq!(stat.largest_contiguous, service.config.words() - old - new);
    }

    #[test]
    fn test_stat_reserves_queued_writes() {
        let mut service = ready();
        store(&mut service, CAL, &[1]);
        service.write(RecordKey::new(FileId::Led, 1), &[0; 6]).unwrap();

        let stat = service.stat();
        assert_eq!(stat.reserved_words, record_words(6));
        assert_eq!(
            stat.largest_contiguous,
            service.config.words() - record_words(1) - record_words(6)
        );
    }

    #[test]
    fn test_queue_limit() {
        let mut service = ready();
        for _ in 0..4 {
            service.garbage_collect().unwrap();
        }
        assert_eq!(service.garbage_collect(), Err(FlashError::NoSpaceInQueues));
    }
}
