//! Over-the-air firmware transfer: the pulling receiver and the stateless distributor.
//!
//! Receiver states: idle (no pending update), requesting/receiving (a [`PendingUpdate`]
//! exists), committed (record persisted, restart requested). A broadcasted update on a
//! non-root node is passive: it applies chunks flooded toward the root without asking.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use tracing::{debug, error, info, warn};

use crate::core::Timer;
use crate::firmware::{FirmwareRecord, FirmwareSink, FirmwareSource, FirmwareWriter, StateStore};
use crate::identity::NodeId;
use crate::protocol::{Announce, Data, DataRequest, FirmwareId};
use crate::scheduler::{Scheduler, TaskId};

/// Identity of one pending update; retry timers carry it and are ignored once stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UpdateId(u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    RetriesExhausted,
    Write(String),
    Finalize(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEffect {
    Send(DataRequest),
    Progress { part_no: u32, no_part: u32 },
    Committed(FirmwareRecord),
    Aborted { md5: String, reason: AbortReason },
}

/// In-memory state of the update being pulled.
pub struct PendingUpdate {
    id: UpdateId,
    pub firmware: FirmwareId,
    pub no_part: u32,
    /// Next part expected.
    pub part_no: u32,
    pub broadcasted: bool,
    /// Last request sent; re-sent on every retry. None while passive.
    request: Option<DataRequest>,
    retry: Option<TaskId>,
}

impl PendingUpdate {
    pub fn is_passive(&self) -> bool {
        self.request.is_none()
    }
}

pub struct OtaReceiver {
    hardware: String,
    role: String,
    current: FirmwareRecord,
    pending: Option<PendingUpdate>,
    writer: Option<Box<dyn FirmwareWriter>>,
    sink: Box<dyn FirmwareSink>,
    store: Box<dyn StateStore>,
    retry_interval_us: u64,
    max_retries: u32,
    next_id: u64,
}

impl OtaReceiver {
    /// Loads the running-firmware record; one written for another role or hardware is ignored.
    pub fn new(
        hardware: &str,
        role: &str,
        sink: Box<dyn FirmwareSink>,
        store: Box<dyn StateStore>,
        retry_interval_us: u64,
        max_retries: u32,
    ) -> Self {
        let current = match store.load() {
            Ok(Some(rec)) if rec.matches(hardware, role) => {
                debug!(md5 = %rec.md5, "running firmware record loaded");
                rec
            }
            Ok(Some(rec)) => {
                warn!(hardware = %rec.hardware, role = %rec.role, "firmware record is for another node type, ignored");
                FirmwareRecord::new(hardware, role)
            }
            Ok(None) => FirmwareRecord::new(hardware, role),
            Err(e) => {
                warn!(error = %e, "cannot load firmware record");
                FirmwareRecord::new(hardware, role)
            }
        };
        Self {
            hardware: hardware.to_string(),
            role: role.to_string(),
            current,
            pending: None,
            writer: None,
            sink,
            store,
            retry_interval_us,
            max_retries,
            next_id: 0,
        }
    }

    pub fn current(&self) -> &FirmwareRecord {
        &self.current
    }

    pub fn pending(&self) -> Option<&PendingUpdate> {
        self.pending.as_ref()
    }

    fn wants(&self, firmware: &FirmwareId) -> bool {
        firmware.role == self.role && firmware.hardware == self.hardware
    }

    pub fn on_announce(
        &mut self,
        ann: &Announce,
        me: NodeId,
        is_root: bool,
        now: u64,
        timers: &mut Scheduler<Timer>,
    ) -> Vec<OtaEffect> {
        if !self.wants(&ann.firmware) {
            return Vec::new();
        }
        let md5 = &ann.firmware.md5;
        if *md5 == self.current.md5 && !ann.forced {
            debug!(%md5, "announced firmware already running");
            return Vec::new();
        }
        if self.pending.as_ref().is_some_and(|p| p.firmware.md5 == *md5) {
            debug!(%md5, "announced firmware already pending");
            return Vec::new();
        }
        // Old retry timer goes before the new state is installed.
        self.discard(timers);
        self.next_id += 1;
        let id = UpdateId(self.next_id);
        info!(%md5, no_part = ann.no_part, broadcasted = ann.broadcasted, from = %ann.from, "new firmware target");
        let mut pending = PendingUpdate {
            id,
            firmware: ann.firmware.clone(),
            no_part: ann.no_part,
            part_no: 0,
            broadcasted: ann.broadcasted,
            request: None,
            retry: None,
        };
        let mut out = Vec::new();
        if !ann.broadcasted || is_root {
            let req = DataRequest::reply_to_announce(ann, me, 0);
            self.arm(&mut pending, req, now, timers, &mut out);
        }
        self.pending = Some(pending);
        out
    }

    pub fn on_data(
        &mut self,
        data: &Data,
        me: NodeId,
        now: u64,
        timers: &mut Scheduler<Timer>,
    ) -> Vec<OtaEffect> {
        let Some(pending) = self.pending.as_ref() else {
            return Vec::new();
        };
        if data.firmware() != &pending.firmware {
            return Vec::new();
        }
        let no_part = pending.no_part;
        if data.no_part() != no_part {
            warn!(expected = no_part, got = data.no_part(), "chunk disagrees on part count, dropped");
            return Vec::new();
        }
        if data.part_no() != pending.part_no {
            return self.out_of_sequence(data, me, now, timers);
        }
        let bytes = match BASE64_STANDARD.decode(data.data.trim()) {
            Ok(b) => b,
            Err(e) => {
                warn!(part_no = data.part_no(), error = %e, "undecodable firmware chunk dropped");
                return Vec::new();
            }
        };
        let mut out = vec![OtaEffect::Progress {
            part_no: data.part_no(),
            no_part,
        }];
        if data.part_no() == 0 {
            // A restarted transfer replaces any half-written image.
            self.writer = None;
            let hint = bytes.len() as u64 * u64::from(no_part);
            match self.sink.begin_write(hint) {
                Ok(w) => self.writer = Some(w),
                Err(e) => {
                    out.push(self.abort(AbortReason::Write(e.to_string()), timers));
                    return out;
                }
            }
        }
        let written = match self.writer.as_mut() {
            Some(w) => w.write_chunk(&bytes).map_err(|e| e.to_string()),
            None => Err("no write in progress".to_string()),
        };
        if let Err(e) = written {
            out.push(self.abort(AbortReason::Write(e), timers));
            return out;
        }

        if data.part_no().saturating_add(1) >= no_part {
            out.push(self.commit(timers));
            return out;
        }

        let Some(mut pending) = self.pending.take() else {
            return out;
        };
        pending.part_no += 1;
        if !pending.is_passive() {
            let req = DataRequest::reply_to_data(data, me, pending.part_no);
            self.arm(&mut pending, req, now, timers, &mut out);
        }
        self.pending = Some(pending);
        out
    }

    /// Retry timer fired. `exhausted` marks the fire after the last re-send.
    pub fn on_retry(
        &mut self,
        id: UpdateId,
        exhausted: bool,
        timers: &mut Scheduler<Timer>,
    ) -> Vec<OtaEffect> {
        let Some(pending) = self.pending.as_ref().filter(|p| p.id == id) else {
            return Vec::new();
        };
        if exhausted {
            error!(md5 = %pending.firmware.md5, part_no = pending.part_no, "no answer to firmware requests, giving up");
            return vec![self.abort(AbortReason::RetriesExhausted, timers)];
        }
        match &pending.request {
            Some(req) => {
                debug!(part_no = req.part_no, "re-sending firmware request");
                vec![OtaEffect::Send(req.clone())]
            }
            None => Vec::new(),
        }
    }

    fn out_of_sequence(
        &mut self,
        data: &Data,
        me: NodeId,
        now: u64,
        timers: &mut Scheduler<Timer>,
    ) -> Vec<OtaEffect> {
        let Some(mut pending) = self.pending.take() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if pending.broadcasted && data.broadcasted() {
            warn!(expected = pending.part_no, got = data.part_no(), "missed a flooded chunk, switching to direct requests");
            pending.broadcasted = false;
            let mut req = DataRequest::reply_to_data(data, me, pending.part_no);
            req.announce.broadcasted = false;
            self.arm(&mut pending, req, now, timers, &mut out);
        } else {
            debug!(expected = pending.part_no, got = data.part_no(), "out of sequence chunk ignored");
        }
        self.pending = Some(pending);
        out
    }

    /// Send `req` now and (re)arm the retry timer with a fresh budget.
    fn arm(
        &self,
        pending: &mut PendingUpdate,
        req: DataRequest,
        now: u64,
        timers: &mut Scheduler<Timer>,
        out: &mut Vec<OtaEffect>,
    ) {
        if let Some(old) = pending.retry.take() {
            timers.cancel(old);
        }
        pending.retry = Some(timers.every(
            now,
            self.retry_interval_us,
            Some(self.max_retries.saturating_add(1)),
            Timer::OtaRetry(pending.id),
        ));
        out.push(OtaEffect::Send(req.clone()));
        pending.request = Some(req);
    }

    fn commit(&mut self, timers: &mut Scheduler<Timer>) -> OtaEffect {
        let Some(pending) = self.take_pending(timers) else {
            return OtaEffect::Aborted {
                md5: String::new(),
                reason: AbortReason::Finalize("no pending update".into()),
            };
        };
        let md5 = pending.firmware.md5.clone();
        let finalized = match self.writer.take() {
            Some(w) => w.finalize(&md5).map_err(|e| e.to_string()),
            None => Err("no write in progress".to_string()),
        };
        if let Err(e) = finalized {
            error!(%md5, error = %e, "firmware finalize failed");
            return OtaEffect::Aborted {
                md5,
                reason: AbortReason::Finalize(e),
            };
        }
        let record = FirmwareRecord {
            md5: md5.clone(),
            hardware: self.hardware.clone(),
            role: self.role.clone(),
            broadcasted: pending.broadcasted,
        };
        if let Err(e) = self.store.save(&record) {
            // The image is flashed; without the record the node would re-download it after reboot.
            error!(%md5, error = %e, "cannot persist firmware record");
        }
        info!(%md5, "firmware committed");
        self.current = record.clone();
        OtaEffect::Committed(record)
    }

    fn abort(&mut self, reason: AbortReason, timers: &mut Scheduler<Timer>) -> OtaEffect {
        self.writer = None;
        let md5 = self
            .take_pending(timers)
            .map(|p| p.firmware.md5)
            .unwrap_or_default();
        if let AbortReason::Write(e) = &reason {
            error!(%md5, error = %e, "firmware write failed, update aborted");
        }
        OtaEffect::Aborted { md5, reason }
    }

    fn discard(&mut self, timers: &mut Scheduler<Timer>) {
        if let Some(old) = self.take_pending(timers) {
            debug!(md5 = %old.firmware.md5, "superseded pending update");
        }
        self.writer = None;
    }

    fn take_pending(&mut self, timers: &mut Scheduler<Timer>) -> Option<PendingUpdate> {
        let mut p = self.pending.take()?;
        if let Some(t) = p.retry.take() {
            timers.cancel(t);
        }
        Some(p)
    }
}

/// Answers data requests from a [`FirmwareSource`]. Keeps no per-request state.
pub struct OtaDistributor {
    source: Box<dyn FirmwareSource>,
}

impl OtaDistributor {
    pub fn new(source: Box<dyn FirmwareSource>) -> Self {
        Self { source }
    }

    /// None if the request is not for us or the part is not available yet.
    pub fn on_data_request(&self, req: &DataRequest, me: NodeId) -> Option<Data> {
        if req.dest != me {
            return None;
        }
        let chunk = self.source.chunk_at(req.firmware(), req.part_no);
        if chunk.is_empty() {
            debug!(part_no = req.part_no, md5 = %req.firmware().md5, "requested part not available");
            return None;
        }
        Some(Data::reply_to(req, BASE64_STANDARD.encode(chunk)))
    }

    /// Announces for every build the source offers.
    pub fn announcements(&self, me: NodeId, broadcasted: bool) -> Vec<Announce> {
        self.source
            .announcements()
            .into_iter()
            .map(|(firmware, no_part)| Announce {
                from: me,
                firmware,
                no_part,
                forced: false,
                broadcasted,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firmware::{FirmwareImage, ImageLibrary, MemorySink, MemoryStore};
    use crate::integrity;

    const ME: NodeId = NodeId(20);
    const DIST: NodeId = NodeId(1);
    const RETRY: u64 = 30_000_000;

    fn image() -> FirmwareImage {
        let bytes: Vec<u8> = (0..30u32).map(|i| (i * 7) as u8).collect();
        FirmwareImage::new("ESP32", "node", bytes, 10)
    }

    fn receiver(store: MemoryStore, sink: MemorySink) -> OtaReceiver {
        OtaReceiver::new("ESP32", "node", Box::new(sink), Box::new(store), RETRY, 3)
    }

    fn distributor(img: &FirmwareImage) -> OtaDistributor {
        let mut lib = ImageLibrary::new();
        lib.insert(img.clone());
        OtaDistributor::new(Box::new(lib))
    }

    fn sent(effects: &[OtaEffect]) -> Vec<&DataRequest> {
        effects
            .iter()
            .filter_map(|e| match e {
                OtaEffect::Send(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn happy_path_commits_and_persists() {
        let img = image();
        let store = MemoryStore::new(None);
        let sink = MemorySink::new();
        let flash = sink.flash();
        let mut rx = receiver(store.clone(), sink);
        let dist = distributor(&img);
        let mut timers = Scheduler::new();

        let ann = img.announce(DIST, false, false);
        let mut effects = rx.on_announce(&ann, ME, false, 0, &mut timers);
        let mut progress = Vec::new();
        for expected in 0..3u32 {
            let reqs = sent(&effects);
            assert_eq!(reqs.len(), 1);
            assert_eq!(reqs[0].part_no, expected);
            assert_eq!(reqs[0].dest, DIST);
            assert_eq!(reqs[0].announce.from, ME);
            let data = dist.on_data_request(reqs[0], DIST).unwrap();
            effects = rx.on_data(&data, ME, 10, &mut timers);
            for e in &effects {
                if let OtaEffect::Progress { part_no, no_part } = e {
                    progress.push((*part_no, *no_part));
                }
            }
        }
        assert_eq!(progress, vec![(0, 3), (1, 3), (2, 3)]);
        let committed = effects
            .iter()
            .find_map(|e| match e {
                OtaEffect::Committed(r) => Some(r.clone()),
                _ => None,
            })
            .unwrap();
        assert_eq!(committed.md5, img.id().md5);
        assert_eq!(store.current().unwrap().md5, img.id().md5);
        assert_eq!(rx.current().md5, img.id().md5);
        assert!(rx.pending().is_none());
        assert!(timers.is_empty());
        let flashed = flash.lock().unwrap().committed.clone().unwrap();
        assert_eq!(integrity::md5_hex(&flashed), img.id().md5);
    }

    #[test]
    fn chunk_with_foreign_part_count_cannot_finish_early() {
        let img = image();
        let sink = MemorySink::new();
        let flash = sink.flash();
        let mut rx = receiver(MemoryStore::new(None), sink);
        let dist = distributor(&img);
        let mut timers = Scheduler::new();

        let effects = rx.on_announce(&img.announce(DIST, false, false), ME, false, 0, &mut timers);
        let mut data = dist.on_data_request(sent(&effects)[0], DIST).unwrap();
        data.request.announce.no_part = 1;
        assert!(rx.on_data(&data, ME, 10, &mut timers).is_empty());
        assert_eq!(rx.pending().unwrap().part_no, 0);
        assert!(flash.lock().unwrap().committed.is_none());

        data.request.announce.no_part = 3;
        let effects = rx.on_data(&data, ME, 20, &mut timers);
        assert!(effects.contains(&OtaEffect::Progress { part_no: 0, no_part: 3 }));
        assert_eq!(rx.pending().unwrap().part_no, 1);
    }

    #[test]
    fn duplicate_and_running_announces_are_ignored() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        assert_eq!(sent(&rx.on_announce(&ann, ME, false, 0, &mut timers)).len(), 1);
        assert!(rx.on_announce(&ann, ME, false, 5, &mut timers).is_empty());
        assert_eq!(timers.len(), 1);

        let running = FirmwareRecord {
            md5: img.id().md5.clone(),
            hardware: "ESP32".into(),
            role: "node".into(),
            broadcasted: false,
        };
        let mut rx = receiver(MemoryStore::new(Some(running)), MemorySink::new());
        assert!(rx.on_announce(&ann, ME, false, 0, &mut timers).is_empty());
        let forced = img.announce(DIST, true, false);
        assert_eq!(sent(&rx.on_announce(&forced, ME, false, 0, &mut timers)).len(), 1);
    }

    #[test]
    fn foreign_role_or_hardware_is_ignored() {
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let other = FirmwareImage::new("ESP8266", "node", vec![1], 10);
        assert!(rx
            .on_announce(&other.announce(DIST, false, false), ME, false, 0, &mut timers)
            .is_empty());
        assert!(rx.pending().is_none());
    }

    #[test]
    fn mismatched_stored_record_is_not_loaded() {
        let rec = FirmwareRecord {
            md5: "abc".into(),
            hardware: "ESP32".into(),
            role: "light".into(),
            broadcasted: false,
        };
        let rx = receiver(MemoryStore::new(Some(rec)), MemorySink::new());
        assert_eq!(rx.current().md5, "");
        assert_eq!(rx.current().role, "node");
    }

    #[test]
    fn new_target_replaces_old_and_its_timer() {
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let a = image();
        let b = FirmwareImage::new("ESP32", "node", vec![9; 25], 10);
        rx.on_announce(&a.announce(DIST, false, false), ME, false, 0, &mut timers);
        let old = rx.pending().unwrap().id;
        rx.on_announce(&b.announce(DIST, false, false), ME, false, 0, &mut timers);
        assert_eq!(timers.len(), 1);
        assert_eq!(rx.pending().unwrap().firmware, *b.id());
        // A stale fire for the old target does nothing.
        assert!(rx.on_retry(old, true, &mut timers).is_empty());
        assert!(rx.pending().is_some());
    }

    #[test]
    fn retries_resend_then_abort() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        rx.on_announce(&ann, ME, false, 0, &mut timers);

        let mut now = 0;
        let mut resends = 0;
        let mut aborted = false;
        while !aborted {
            now += RETRY;
            for fired in timers.due(now) {
                let Timer::OtaRetry(id) = fired.task else { continue };
                for e in rx.on_retry(id, fired.exhausted, &mut timers) {
                    match e {
                        OtaEffect::Send(r) => {
                            assert_eq!(r.part_no, 0);
                            resends += 1;
                        }
                        OtaEffect::Aborted { reason, .. } => {
                            assert_eq!(reason, AbortReason::RetriesExhausted);
                            aborted = true;
                        }
                        _ => {}
                    }
                }
            }
            assert!(now < 10 * RETRY, "never aborted");
        }
        assert_eq!(resends, 3);
        assert!(rx.pending().is_none());
        assert!(timers.is_empty());
        // Eligible again.
        assert_eq!(sent(&rx.on_announce(&ann, ME, false, now, &mut timers)).len(), 1);
    }

    #[test]
    fn broadcasted_passive_node_observes_without_requesting() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let dist = distributor(&img);
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, true);
        assert!(rx.on_announce(&ann, ME, false, 0, &mut timers).is_empty());
        assert!(rx.pending().unwrap().is_passive());
        assert!(timers.is_empty());

        // The root pulls; we see the flooded replies.
        let root = NodeId(5);
        let req0 = DataRequest::reply_to_announce(&ann, root, 0);
        let data0 = dist.on_data_request(&req0, DIST).unwrap();
        let effects = rx.on_data(&data0, ME, 1, &mut timers);
        assert!(sent(&effects).is_empty());
        assert_eq!(rx.pending().unwrap().part_no, 1);
    }

    #[test]
    fn root_requests_even_when_broadcasted() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let effects = rx.on_announce(&img.announce(DIST, false, true), ME, true, 0, &mut timers);
        let reqs = sent(&effects);
        assert_eq!(reqs.len(), 1);
        assert!(reqs[0].announce.broadcasted);
    }

    #[test]
    fn missed_flooded_chunk_falls_back_to_direct_requests() {
        let bytes = vec![3u8; 50];
        let img = FirmwareImage::new("ESP32", "node", bytes, 10);
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let dist = distributor(&img);
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, true);
        rx.on_announce(&ann, ME, false, 0, &mut timers);
        let root = NodeId(5);
        for part in 0..2 {
            let req = DataRequest::reply_to_announce(&ann, root, part);
            rx.on_data(&dist.on_data_request(&req, DIST).unwrap(), ME, 0, &mut timers);
        }
        assert_eq!(rx.pending().unwrap().part_no, 2);

        let req3 = DataRequest::reply_to_announce(&ann, root, 3);
        let data3 = dist.on_data_request(&req3, DIST).unwrap();
        let effects = rx.on_data(&data3, ME, 0, &mut timers);
        let reqs = sent(&effects);
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].part_no, 2);
        assert_eq!(reqs[0].dest, DIST);
        assert_eq!(reqs[0].announce.from, ME);
        assert!(!reqs[0].announce.broadcasted);
        let p = rx.pending().unwrap();
        assert!(!p.broadcasted);
        assert_eq!(p.part_no, 2);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn out_of_sequence_point_to_point_is_ignored() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let dist = distributor(&img);
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        rx.on_announce(&ann, ME, false, 0, &mut timers);
        let req2 = DataRequest::reply_to_announce(&ann, ME, 2);
        let data2 = dist.on_data_request(&req2, DIST).unwrap();
        assert!(rx.on_data(&data2, ME, 0, &mut timers).is_empty());
        assert_eq!(rx.pending().unwrap().part_no, 0);
    }

    #[test]
    fn write_failure_aborts_update() {
        let img = image();
        let sink = MemorySink::new();
        sink.flash().lock().unwrap().fail_after = Some(1);
        let mut rx = receiver(MemoryStore::new(None), sink);
        let dist = distributor(&img);
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        let effects = rx.on_announce(&ann, ME, false, 0, &mut timers);
        let d0 = dist.on_data_request(sent(&effects)[0], DIST).unwrap();
        let effects = rx.on_data(&d0, ME, 0, &mut timers);
        let d1 = dist.on_data_request(sent(&effects)[0], DIST).unwrap();
        let effects = rx.on_data(&d1, ME, 0, &mut timers);
        assert!(effects
            .iter()
            .any(|e| matches!(e, OtaEffect::Aborted { reason: AbortReason::Write(_), .. })));
        assert!(rx.pending().is_none());
        assert!(timers.is_empty());
    }

    #[test]
    fn corrupted_image_fails_finalize() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        let effects = rx.on_announce(&ann, ME, false, 0, &mut timers);
        let mut req = sent(&effects)[0].clone();
        let mut last = Vec::new();
        for part in 0..3 {
            req.part_no = part;
            let data = Data::reply_to(&req, BASE64_STANDARD.encode([0u8; 10]));
            last = rx.on_data(&data, ME, 0, &mut timers);
        }
        assert!(last
            .iter()
            .any(|e| matches!(e, OtaEffect::Aborted { reason: AbortReason::Finalize(_), .. })));
        assert_eq!(rx.current().md5, "");
    }

    #[test]
    fn bad_base64_is_dropped_without_state_change() {
        let img = image();
        let mut rx = receiver(MemoryStore::new(None), MemorySink::new());
        let mut timers = Scheduler::new();
        let ann = img.announce(DIST, false, false);
        let effects = rx.on_announce(&ann, ME, false, 0, &mut timers);
        let data = Data::reply_to(sent(&effects)[0], "!!not base64!!".into());
        assert!(rx.on_data(&data, ME, 0, &mut timers).is_empty());
        assert_eq!(rx.pending().unwrap().part_no, 0);
    }

    #[test]
    fn distributor_skips_unavailable_parts_and_foreign_requests() {
        let img = image();
        let dist = distributor(&img);
        let ann = img.announce(DIST, false, false);
        let missing = DataRequest::reply_to_announce(&ann, ME, 7);
        assert!(dist.on_data_request(&missing, DIST).is_none());
        let ok = DataRequest::reply_to_announce(&ann, ME, 1);
        assert!(dist.on_data_request(&ok, NodeId(99)).is_none());
        let data = dist.on_data_request(&ok, DIST).unwrap();
        assert_eq!(BASE64_STANDARD.decode(&data.data).unwrap(), img.part(1).unwrap());
        assert_eq!(data.request.dest, ME);

        let anns = dist.announcements(DIST, true);
        assert_eq!(anns.len(), 1);
        assert_eq!(anns[0].no_part, 3);
        assert!(anns[0].broadcasted);
    }
}
