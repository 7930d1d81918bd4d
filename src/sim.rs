//! In-memory collaborators for exercising both checkpoint loops without a
//! hypervisor. Every side effect is appended to a shared [`EventLog`].

use crate::collaborators::{
    Collaborators, CompareOracle, CompareVerdict, DeviceStateCodec, MachineLock, MemoryTransport,
    NetworkReconfig, StorageReplication, VmControl,
};
use crate::error::{CollaboratorError, NetReconfigError};
use crate::session::Role;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::{Read, Write};
use std::sync::Arc;

pub const PAGE_SIZE: usize = 64;
pub const STREAM_MAGIC: u64 = 0x5349_4d52_414d_0001;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SimEvent {
    VmStop,
    VmStart,
    VmReset,
    ShutdownRequested,
    HotplugAllowed(bool),
    StorageStart(Role),
    StorageStop { failover: bool },
    StorageCheckpoint,
    OracleCheckpoint(Role),
    OracleFailover,
    NetworkApply(Role),
    NetworkRevert(Role),
    PagesSaved { pages: u64, full: bool },
    PagesLoaded { pages: u64 },
    CacheFlushed,
    DeviceStateSaved { bytes: u64 },
    DeviceStateLoaded,
}

#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<SimEvent>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, event: SimEvent) {
        self.events.lock().push(event);
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, event: &SimEvent) -> usize {
        self.events.lock().iter().filter(|seen| *seen == event).count()
    }

    pub fn position(&self, event: &SimEvent) -> Option<usize> {
        self.events.lock().iter().position(|seen| seen == event)
    }
}

/// Device/model state carried in the checkpoint buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub ticks: u64,
    pub program_counter: u64,
    pub registers: BTreeMap<String, u64>,
}

#[derive(Debug)]
struct MachineInner {
    running: bool,
    hotplug_allowed: bool,
    shutdown_requested: bool,
    pages: Vec<[u8; PAGE_SIZE]>,
    dirty: BTreeSet<usize>,
    cache: Option<BTreeMap<usize, [u8; PAGE_SIZE]>>,
    model: DeviceModel,
}

/// Simulated guest: run state, a page array with dirty tracking and a device model.
pub struct SimMachine {
    inner: Mutex<MachineInner>,
    machine: MachineLock,
    events: EventLog,
}

impl SimMachine {
    pub fn new(page_count: usize, machine: MachineLock, events: EventLog) -> Self {
        Self {
            inner: Mutex::new(MachineInner {
                running: false,
                hotplug_allowed: true,
                shutdown_requested: false,
                pages: vec![[0u8; PAGE_SIZE]; page_count],
                dirty: BTreeSet::new(),
                cache: None,
                model: DeviceModel::default(),
            }),
            machine,
            events,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.inner.lock().model.clone()
    }

    pub fn set_model(&self, model: DeviceModel) {
        self.inner.lock().model = model;
    }

    pub fn page(&self, index: usize) -> Option<[u8; PAGE_SIZE]> {
        self.inner.lock().pages.get(index).copied()
    }

    pub fn dirty_pages(&self) -> usize {
        self.inner.lock().dirty.len()
    }

    pub fn shutdown_requested(&self) -> bool {
        self.inner.lock().shutdown_requested
    }

    pub fn hotplug_allowed(&self) -> bool {
        self.inner.lock().hotplug_allowed
    }

    /// Writes `value` across one page and marks it dirty.
    pub fn write_page(&self, index: usize, value: u8) {
        let mut inner = self.inner.lock();
        if let Some(page) = inner.pages.get_mut(index) {
            page.fill(value);
            inner.dirty.insert(index);
        }
    }

    /// One step of guest execution. Does nothing while the VM is stopped.
    pub fn guest_tick<R: Rng>(&self, rng: &mut R) {
        let _machine = self.machine.lock();
        let mut inner = self.inner.lock();
        if !inner.running || inner.pages.is_empty() {
            return;
        }
        let index = rng.gen_range(0..inner.pages.len());
        let value: u8 = rng.gen();
        inner.pages[index].fill(value);
        inner.dirty.insert(index);
        inner.model.ticks += 1;
        inner.model.program_counter = rng.gen();
        let register = format!("r{}", index % 8);
        *inner.model.registers.entry(register).or_insert(0) += u64::from(value);
    }

    fn write_pages(&self, sink: &mut dyn Write, full: bool) -> Result<u64, CollaboratorError> {
        let (indices, pages): (Vec<usize>, Vec<[u8; PAGE_SIZE]>) = {
            let mut inner = self.inner.lock();
            let indices: Vec<usize> = std::mem::take(&mut inner.dirty).into_iter().collect();
            let pages = indices.iter().map(|index| inner.pages[*index]).collect();
            (indices, pages)
        };
        let count = indices.len() as u64;
        sink.write_all(&count.to_be_bytes())?;
        for (index, page) in indices.iter().zip(pages.iter()) {
            sink.write_all(&(*index as u64).to_be_bytes())?;
            sink.write_all(page)?;
        }
        self.events.record(SimEvent::PagesSaved { pages: count, full });
        Ok(count)
    }
}

fn read_u64(source: &mut dyn Read) -> Result<u64, CollaboratorError> {
    let mut raw = [0u8; 8];
    source.read_exact(&mut raw)?;
    Ok(u64::from_be_bytes(raw))
}

impl VmControl for SimMachine {
    fn stop(&self) {
        self.inner.lock().running = false;
        self.events.record(SimEvent::VmStop);
    }

    fn start(&self) {
        self.inner.lock().running = true;
        self.events.record(SimEvent::VmStart);
    }

    fn is_running(&self) -> bool {
        self.inner.lock().running
    }

    fn reset(&self) {
        self.inner.lock().model = DeviceModel::default();
        self.events.record(SimEvent::VmReset);
    }

    fn request_shutdown(&self) {
        self.inner.lock().shutdown_requested = true;
        self.events.record(SimEvent::ShutdownRequested);
    }

    fn set_hotplug_allowed(&self, allowed: bool) -> bool {
        let previous = std::mem::replace(&mut self.inner.lock().hotplug_allowed, allowed);
        self.events.record(SimEvent::HotplugAllowed(allowed));
        previous
    }
}

impl DeviceStateCodec for SimMachine {
    fn serialize(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError> {
        let model = self.model();
        let encoded = serde_json::to_vec(&model)
            .map_err(|err| CollaboratorError::failed("device state encode", err.to_string()))?;
        sink.write_all(&encoded)?;
        let bytes = encoded.len() as u64;
        self.events.record(SimEvent::DeviceStateSaved { bytes });
        Ok(bytes)
    }

    fn deserialize(&self, source: &mut dyn Read) -> Result<(), CollaboratorError> {
        let model: DeviceModel = serde_json::from_reader(source)
            .map_err(|err| CollaboratorError::failed("device state decode", err.to_string()))?;
        self.set_model(model);
        self.events.record(SimEvent::DeviceStateLoaded);
        Ok(())
    }
}

impl MemoryTransport for SimMachine {
    fn begin_save(&self, sink: &mut dyn Write) -> Result<(), CollaboratorError> {
        let page_count = self.inner.lock().pages.len() as u64;
        sink.write_all(&STREAM_MAGIC.to_be_bytes())?;
        sink.write_all(&page_count.to_be_bytes())?;
        Ok(())
    }

    fn begin_load(&self, source: &mut dyn Read) -> Result<(), CollaboratorError> {
        let magic = read_u64(source)?;
        if magic != STREAM_MAGIC {
            return Err(CollaboratorError::failed(
                "memory stream preamble",
                format!("bad magic {magic:#x}"),
            ));
        }
        let page_count = read_u64(source)?;
        let local = self.inner.lock().pages.len() as u64;
        if page_count != local {
            return Err(CollaboratorError::failed(
                "memory stream preamble",
                format!("peer has {page_count} pages, local machine has {local}"),
            ));
        }
        Ok(())
    }

    fn save_full(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError> {
        self.write_pages(sink, true)
    }

    fn save_incremental(&self, sink: &mut dyn Write) -> Result<u64, CollaboratorError> {
        self.write_pages(sink, false)
    }

    /// Loads into the working cache when one exists, else into live pages.
    fn load(&self, source: &mut dyn Read) -> Result<(), CollaboratorError> {
        let count = read_u64(source)?;
        let mut received = Vec::new();
        for _ in 0..count {
            let index = read_u64(source)? as usize;
            let mut page = [0u8; PAGE_SIZE];
            source.read_exact(&mut page)?;
            received.push((index, page));
        }
        {
            let mut inner = self.inner.lock();
            let MachineInner { pages, cache, .. } = &mut *inner;
            for (index, page) in received {
                if index >= pages.len() {
                    return Err(CollaboratorError::failed(
                        "memory load",
                        format!("page {index} out of range"),
                    ));
                }
                match cache.as_mut() {
                    Some(cache) => {
                        cache.insert(index, page);
                    }
                    None => pages[index] = page,
                }
            }
        }
        self.events.record(SimEvent::PagesLoaded { pages: count });
        Ok(())
    }

    fn pending_bytes(&self, _budget: u64) -> u64 {
        (self.inner.lock().dirty.len() * PAGE_SIZE) as u64
    }

    fn init_cache(&self) -> Result<(), CollaboratorError> {
        self.inner.lock().cache = Some(BTreeMap::new());
        Ok(())
    }

    fn flush_cache(&self) -> Result<(), CollaboratorError> {
        let mut inner = self.inner.lock();
        let staged = match inner.cache.as_mut() {
            Some(cache) => std::mem::take(cache),
            None => return Err(CollaboratorError::failed("cache flush", "no working cache")),
        };
        for (index, page) in staged {
            inner.pages[index] = page;
        }
        drop(inner);
        self.events.record(SimEvent::CacheFlushed);
        Ok(())
    }

    fn release_cache(&self) {
        self.inner.lock().cache = None;
    }
}

#[derive(Debug, Default)]
struct StorageFaults {
    start: bool,
    checkpoint: bool,
}

pub struct SimStorage {
    faults: Mutex<StorageFaults>,
    events: EventLog,
}

impl SimStorage {
    pub fn new(events: EventLog) -> Self {
        Self {
            faults: Mutex::new(StorageFaults::default()),
            events,
        }
    }

    pub fn fail_start(&self) {
        self.faults.lock().start = true;
    }

    pub fn fail_checkpoint(&self) {
        self.faults.lock().checkpoint = true;
    }
}

impl StorageReplication for SimStorage {
    fn start(&self, role: Role) -> Result<(), CollaboratorError> {
        if self.faults.lock().start {
            return Err(CollaboratorError::failed("storage start", "injected fault"));
        }
        self.events.record(SimEvent::StorageStart(role));
        Ok(())
    }

    fn stop(&self, failover: bool) -> Result<(), CollaboratorError> {
        self.events.record(SimEvent::StorageStop { failover });
        Ok(())
    }

    fn checkpoint(&self) -> Result<(), CollaboratorError> {
        if self.faults.lock().checkpoint {
            return Err(CollaboratorError::failed("storage checkpoint", "injected fault"));
        }
        self.events.record(SimEvent::StorageCheckpoint);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct OracleScript {
    verdicts: VecDeque<CompareVerdict>,
    fail_compare: bool,
    fail_checkpoint: bool,
}

/// Compare oracle replaying scripted verdicts, then reporting `Match`.
pub struct SimOracle {
    script: Mutex<OracleScript>,
    events: EventLog,
}

impl SimOracle {
    pub fn new(events: EventLog) -> Self {
        Self {
            script: Mutex::new(OracleScript::default()),
            events,
        }
    }

    pub fn push_verdict(&self, verdict: CompareVerdict) {
        self.script.lock().verdicts.push_back(verdict);
    }

    pub fn fail_compare(&self) {
        self.script.lock().fail_compare = true;
    }

    pub fn fail_checkpoint(&self) {
        self.script.lock().fail_checkpoint = true;
    }
}

impl CompareOracle for SimOracle {
    fn compare(&self) -> Result<CompareVerdict, CollaboratorError> {
        let mut script = self.script.lock();
        if script.fail_compare {
            return Err(CollaboratorError::failed("compare", "injected fault"));
        }
        Ok(script.verdicts.pop_front().unwrap_or(CompareVerdict::Match))
    }

    fn checkpoint(&self, role: Role) -> Result<(), CollaboratorError> {
        if self.script.lock().fail_checkpoint {
            return Err(CollaboratorError::failed("compare checkpoint", "injected fault"));
        }
        self.events.record(SimEvent::OracleCheckpoint(role));
        Ok(())
    }

    fn failover(&self) -> Result<(), CollaboratorError> {
        self.events.record(SimEvent::OracleFailover);
        Ok(())
    }
}

pub struct SimNetwork {
    events: EventLog,
}

impl SimNetwork {
    pub fn new(events: EventLog) -> Self {
        Self { events }
    }
}

impl NetworkReconfig for SimNetwork {
    fn apply(&self, role: Role) -> Result<(), NetReconfigError> {
        self.events.record(SimEvent::NetworkApply(role));
        Ok(())
    }

    fn revert(&self, role: Role) -> Result<(), NetReconfigError> {
        self.events.record(SimEvent::NetworkRevert(role));
        Ok(())
    }
}

/// One simulated host: every collaborator wired to a shared lock and event log.
pub struct SimNode {
    pub machine: Arc<SimMachine>,
    pub storage: Arc<SimStorage>,
    pub oracle: Arc<SimOracle>,
    pub network: Arc<SimNetwork>,
    pub events: EventLog,
    pub lock: MachineLock,
}

impl SimNode {
    pub fn new(page_count: usize) -> Self {
        let events = EventLog::new();
        let lock = MachineLock::new();
        Self {
            machine: Arc::new(SimMachine::new(page_count, lock.clone(), events.clone())),
            storage: Arc::new(SimStorage::new(events.clone())),
            oracle: Arc::new(SimOracle::new(events.clone())),
            network: Arc::new(SimNetwork::new(events.clone())),
            events,
            lock,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            vm: self.machine.clone(),
            storage: self.storage.clone(),
            codec: self.machine.clone(),
            memory: self.machine.clone(),
            oracle: self.oracle.clone(),
            network: self.network.clone(),
            machine: self.lock.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::CheckpointBuffer;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn device_model_survives_buffer_round_trip() {
        let node = SimNode::new(4);
        let mut registers = BTreeMap::new();
        registers.insert("r0".to_string(), 17);
        registers.insert("r3".to_string(), 4096);
        let model = DeviceModel {
            ticks: 99,
            program_counter: 0xdead_beef,
            registers,
        };
        node.machine.set_model(model.clone());

        let mut buffer = CheckpointBuffer::default();
        let written = node.machine.serialize(&mut buffer.open_write()).unwrap();
        assert_eq!(written, buffer.len());

        node.machine.reset();
        assert_eq!(node.machine.model(), DeviceModel::default());
        node.machine.deserialize(&mut buffer.open_read()).unwrap();
        assert_eq!(node.machine.model(), model);
    }

    #[test]
    fn page_stream_lands_in_cache_until_flushed() {
        let primary = SimNode::new(8);
        let secondary = SimNode::new(8);
        primary.machine.write_page(2, 0xAB);
        primary.machine.write_page(5, 0x11);
        assert_eq!(primary.machine.pending_bytes(0), 2 * PAGE_SIZE as u64);

        let mut wire = Vec::new();
        primary.machine.begin_save(&mut wire).unwrap();
        assert_eq!(primary.machine.save_full(&mut wire).unwrap(), 2);
        assert_eq!(primary.machine.dirty_pages(), 0);

        secondary.machine.init_cache().unwrap();
        let mut source = std::io::Cursor::new(wire);
        secondary.machine.begin_load(&mut source).unwrap();
        secondary.machine.load(&mut source).unwrap();
        assert_eq!(secondary.machine.page(2), Some([0u8; PAGE_SIZE]));
        secondary.machine.flush_cache().unwrap();
        assert_eq!(secondary.machine.page(2), Some([0xAB; PAGE_SIZE]));
        assert_eq!(secondary.machine.page(5), Some([0x11; PAGE_SIZE]));
    }

    #[test]
    fn preamble_rejects_mismatched_machines() {
        let primary = SimNode::new(8);
        let secondary = SimNode::new(4);
        let mut wire = Vec::new();
        primary.machine.begin_save(&mut wire).unwrap();
        assert!(secondary
            .machine
            .begin_load(&mut std::io::Cursor::new(wire))
            .is_err());
    }

    #[test]
    fn guest_only_runs_while_started() {
        let node = SimNode::new(4);
        let mut rng = StdRng::seed_from_u64(7);
        node.machine.guest_tick(&mut rng);
        assert_eq!(node.machine.model().ticks, 0);
        node.machine.start();
        node.machine.guest_tick(&mut rng);
        assert_eq!(node.machine.model().ticks, 1);
        assert_eq!(node.machine.dirty_pages(), 1);
    }

    #[test]
    fn oracle_replays_script_then_matches() {
        let node = SimNode::new(1);
        node.oracle.push_verdict(CompareVerdict::Mismatch);
        assert_eq!(node.oracle.compare().unwrap(), CompareVerdict::Mismatch);
        assert_eq!(node.oracle.compare().unwrap(), CompareVerdict::Match);
        node.oracle.fail_compare();
        assert!(node.oracle.compare().is_err());
    }
}
