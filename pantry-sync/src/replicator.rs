//! Per-connection replication state machine.
//!
//! ```text
//!   push side:  Idle ─Request─► Sending ─Changes─► Idle
//!   pull side:  Idle ─Poke─► RequestSent ─Changes─► Applying ─► Idle
//!                                 ▲                      │
//!                                 └──── still behind ────┘  (paging)
//! ```
//!
//! The replicator owns no I/O. Each handler takes the store and pushes the
//! messages to send into `out`; the peer manager writes them to the session.
//! At most one request per remote site is outstanding at a time.

use pantry_core::{ApplyReport, ChangeStore, SiteId};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::error::SyncError;
use crate::protocol::{ProtocolError, SyncMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingRequest {
    request_id: u64,
    since: u64,
    issued_at: Instant,
}

/// Replication state for one established connection.
#[derive(Debug)]
pub struct Replicator {
    local_site: SiteId,
    remote_site: SiteId,
    pending: HashMap<SiteId, PendingRequest>,
    /// Highest version the remote has advertised per site
    remote_max: HashMap<SiteId, u64>,
    next_request_id: u64,
    max_batch_records: usize,
    request_timeout: Option<Duration>,
}

impl Replicator {
    pub fn new(
        local_site: SiteId,
        remote_site: SiteId,
        max_batch_records: usize,
        request_timeout: Option<Duration>,
    ) -> Self {
        Self {
            local_site,
            remote_site,
            pending: HashMap::new(),
            remote_max: HashMap::new(),
            next_request_id: 1,
            max_batch_records,
            request_timeout,
        }
    }

    pub fn remote_site(&self) -> SiteId {
        self.remote_site
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn is_pending(&self, site: &SiteId) -> bool {
        self.pending.contains_key(site)
    }

    /// Advertise everything we hold, except what the remote originated.
    pub fn on_open(&self, store: &dyn ChangeStore, out: &mut Vec<SyncMessage>) {
        for (site, version) in store.clock().sites() {
            if site != self.remote_site && version > 0 {
                out.push(SyncMessage::poke(site, version));
            }
        }
    }

    /// Advertise a new local version.
    pub fn local_poke(&self, version: u64, out: &mut Vec<SyncMessage>) {
        if version > 0 {
            out.push(SyncMessage::poke(self.local_site, version));
        }
    }

    pub fn on_poke(
        &mut self,
        store: &dyn ChangeStore,
        site: SiteId,
        version: u64,
        out: &mut Vec<SyncMessage>,
    ) {
        if site == self.local_site {
            return;
        }
        let max = self.remote_max.entry(site).or_insert(0);
        *max = (*max).max(version);

        if store.cursor(&site) < version && !self.pending.contains_key(&site) {
            self.request(store, site, out);
        }
    }

    /// Serve a page of our log.
    pub fn on_request(
        &self,
        store: &dyn ChangeStore,
        request_id: u64,
        site: SiteId,
        since: u64,
        out: &mut Vec<SyncMessage>,
    ) -> Result<(), SyncError> {
        let records = store.changes_since(site, since, Some(self.max_batch_records))?;
        log::trace!(
            "Serving {} records of {} since {since} to {}",
            records.len(),
            site.short(),
            self.remote_site.short()
        );
        out.push(SyncMessage::changes(
            request_id,
            site,
            records,
            store.cursor(&site),
        ));
        Ok(())
    }

    /// Apply the answer to our outstanding request.
    ///
    /// Returns the apply report when the batch moved the cursor, `None` for
    /// stale answers and batches that taught us nothing.
    pub fn on_changes(
        &mut self,
        store: &dyn ChangeStore,
        request_id: u64,
        site: SiteId,
        records: Vec<pantry_core::ChangeRecord>,
        available: u64,
        out: &mut Vec<SyncMessage>,
    ) -> Result<Option<ApplyReport>, SyncError> {
        match self.pending.get(&site) {
            Some(pending) if pending.request_id == request_id => {}
            _ => {
                log::debug!(
                    "Ignoring stale changes #{request_id} for {} from {}",
                    site.short(),
                    self.remote_site.short()
                );
                return Ok(None);
            }
        }
        self.pending.remove(&site);

        if records.iter().any(|rec| rec.site_id != site) {
            return Err(ProtocolError::UnexpectedMessage("changes for another site").into());
        }

        let report = store.apply(&records)?;
        if !report.is_noop() {
            log::debug!(
                "Applied {} new records ({} duplicates) of {} from {}",
                report.new_records(),
                report.duplicates,
                site.short(),
                self.remote_site.short()
            );
        }

        let max = self.remote_max.entry(site).or_insert(0);
        *max = (*max).max(available);
        if !records.is_empty() && store.cursor(&site) < *max {
            self.request(store, site, out);
        }

        Ok((!report.is_noop()).then_some(report))
    }

    /// Re-issue requests older than the timeout under fresh ids.
    pub fn expired(&mut self, store: &dyn ChangeStore, now: Instant, out: &mut Vec<SyncMessage>) {
        let Some(timeout) = self.request_timeout else {
            return;
        };
        let stale: Vec<(SiteId, u64)> = self
            .pending
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.issued_at) >= timeout)
            .map(|(site, p)| (*site, p.since))
            .collect();
        for (site, since) in stale {
            log::debug!(
                "Request for {} since {since} to {} timed out, re-sending",
                site.short(),
                self.remote_site.short()
            );
            self.pending.remove(&site);
            self.request(store, site, out);
        }
    }

    fn request(&mut self, store: &dyn ChangeStore, site: SiteId, out: &mut Vec<SyncMessage>) {
        let request_id = self.next_request_id;
        self.next_request_id += 1;
        let since = store.cursor(&site);
        self.pending.insert(
            site,
            PendingRequest {
                request_id,
                since,
                issued_at: Instant::now(),
            },
        );
        out.push(SyncMessage::request(request_id, site, since));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::{ChangesetSink, ChangesetSource, LocalWrites, MemoryStore, Schema};

    fn schema() -> Schema {
        Schema::new().table("recipes", ["name", "note"])
    }

    fn write(store: &MemoryStore, pk: &str, name: &str) -> u64 {
        let mut writes = LocalWrites::new();
        writes.set("recipes", pk, "name", name);
        store.commit(writes).unwrap()
    }

    fn request_of(msg: &SyncMessage) -> (u64, SiteId, u64) {
        match msg {
            SyncMessage::Request {
                request_id,
                site_id,
                since,
            } => (*request_id, *site_id, *since),
            other => panic!("Expected Request, got {other:?}"),
        }
    }

    #[test]
    fn test_poke_triggers_single_request() {
        let local = MemoryStore::new(schema());
        let remote_site = SiteId::new();
        let mut rep = Replicator::new(local.site_id(), remote_site, 16, None);
        let mut out = Vec::new();

        rep.on_poke(&local, remote_site, 4, &mut out);
        rep.on_poke(&local, remote_site, 6, &mut out);

        assert_eq!(out.len(), 1);
        let (_, site, since) = request_of(&out[0]);
        assert_eq!(site, remote_site);
        assert_eq!(since, 0);
        assert!(rep.is_pending(&remote_site));
    }

    #[test]
    fn test_poke_for_known_version_ignored() {
        let local = MemoryStore::new(schema());
        let mut rep = Replicator::new(local.site_id(), SiteId::new(), 16, None);
        let mut out = Vec::new();

        rep.on_poke(&local, local.site_id(), 100, &mut out);
        rep.on_poke(&local, SiteId::new(), 0, &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn test_request_changes_cycle() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        write(&a, "r1", "Soup");
        write(&a, "r2", "Stew");

        let rep_a = Replicator::new(a.site_id(), b.site_id(), 16, None);
        let mut rep_b = Replicator::new(b.site_id(), a.site_id(), 16, None);

        let mut to_b = Vec::new();
        rep_a.on_open(&a, &mut to_b);
        assert_eq!(to_b, vec![SyncMessage::poke(a.site_id(), 2)]);

        let mut to_a = Vec::new();
        rep_b.on_poke(&b, a.site_id(), 2, &mut to_a);
        let (request_id, site, since) = request_of(&to_a[0]);

        let mut to_b = Vec::new();
        rep_a
            .on_request(&a, request_id, site, since, &mut to_b)
            .unwrap();
        let SyncMessage::Changes {
            request_id,
            site_id,
            records,
            available,
        } = to_b.remove(0)
        else {
            panic!("Expected Changes");
        };
        assert_eq!(records.len(), 2);

        let mut out = Vec::new();
        let report = rep_b
            .on_changes(&b, request_id, site_id, records, available, &mut out)
            .unwrap()
            .expect("batch should advance the cursor");
        assert_eq!(report.advanced, vec![(a.site_id(), 2)]);
        assert!(out.is_empty());
        assert_eq!(rep_b.pending_count(), 0);
        assert_eq!(b.cursor(&a.site_id()), 2);
    }

    #[test]
    fn test_paging_requests_next_page() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        for i in 0..5 {
            write(&a, &format!("r{i}"), "x");
        }
        let rep_a = Replicator::new(a.site_id(), b.site_id(), 2, None);
        let mut rep_b = Replicator::new(b.site_id(), a.site_id(), 2, None);

        let mut out = Vec::new();
        rep_b.on_poke(&b, a.site_id(), 5, &mut out);

        let mut rounds = 0;
        while let Some(msg) = out.pop() {
            let (request_id, site, since) = request_of(&msg);
            let mut reply = Vec::new();
            rep_a
                .on_request(&a, request_id, site, since, &mut reply)
                .unwrap();
            let SyncMessage::Changes {
                records, available, ..
            } = reply.remove(0)
            else {
                panic!("Expected Changes");
            };
            assert!(records.len() <= 2);
            rep_b
                .on_changes(&b, request_id, site, records, available, &mut out)
                .unwrap();
            rounds += 1;
        }
        assert_eq!(rounds, 3);
        assert_eq!(b.cursor(&a.site_id()), 5);
        assert_eq!(b.rows("recipes").unwrap().len(), 5);
    }

    #[test]
    fn test_stale_changes_ignored() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        write(&a, "r1", "Soup");
        let mut rep_b = Replicator::new(b.site_id(), a.site_id(), 16, None);

        let records = a.changes_since(a.site_id(), 0, None).unwrap();
        let mut out = Vec::new();
        let result = rep_b
            .on_changes(&b, 99, a.site_id(), records, 1, &mut out)
            .unwrap();
        assert!(result.is_none());
        assert_eq!(b.cursor(&a.site_id()), 0);
    }

    #[test]
    fn test_answer_to_closed_connection_not_applied() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        for i in 0..3 {
            write(&a, &format!("r{i}"), "x");
        }
        // One version (row marker + name) per page
        let rep_a = Replicator::new(a.site_id(), b.site_id(), 2, None);
        let mut first = Replicator::new(b.site_id(), a.site_id(), 2, None);

        let mut out = Vec::new();
        first.on_poke(&b, a.site_id(), 3, &mut out);
        let (request_id, site, since) = request_of(&out.remove(0));
        let mut replies = Vec::new();
        rep_a.on_request(&a, request_id, site, since, &mut replies).unwrap();
        let SyncMessage::Changes {
            request_id,
            site_id,
            records,
            available,
        } = replies.remove(0)
        else {
            panic!("Expected Changes");
        };
        first
            .on_changes(&b, request_id, site_id, records, available, &mut out)
            .unwrap();
        assert_eq!(b.cursor(&a.site_id()), 1);

        // The follow-up is in flight when the connection goes away
        let (outstanding, site, since) = request_of(&out.remove(0));
        assert_eq!(since, 1);
        rep_a.on_request(&a, outstanding, site, since, &mut replies).unwrap();
        let late = replies.remove(0);
        drop(first);

        let mut second = Replicator::new(b.site_id(), a.site_id(), 2, None);
        second.on_poke(&b, a.site_id(), 3, &mut out);
        let (fresh, _, since) = request_of(&out[0]);
        assert_eq!(since, 1);
        assert_ne!(fresh, outstanding);

        let before = b.checksum().unwrap();
        let SyncMessage::Changes {
            request_id,
            site_id,
            records,
            available,
        } = late
        else {
            panic!("Expected Changes");
        };
        let mut ignored = Vec::new();
        let result = second
            .on_changes(&b, request_id, site_id, records, available, &mut ignored)
            .unwrap();
        assert!(result.is_none());
        assert!(ignored.is_empty());
        assert_eq!(b.checksum().unwrap(), before);
        assert!(second.is_pending(&a.site_id()));

        while let Some(msg) = out.pop() {
            match msg {
                SyncMessage::Request {
                    request_id,
                    site_id,
                    since,
                } => rep_a
                    .on_request(&a, request_id, site_id, since, &mut out)
                    .unwrap(),
                SyncMessage::Changes {
                    request_id,
                    site_id,
                    records,
                    available,
                } => {
                    second
                        .on_changes(&b, request_id, site_id, records, available, &mut out)
                        .unwrap();
                }
                other => panic!("Unexpected {other:?}"),
            }
        }
        assert_eq!(b.cursor(&a.site_id()), 3);
        assert_eq!(b.rows("recipes").unwrap().len(), 3);
    }

    #[test]
    fn test_changes_for_wrong_site_is_protocol_error() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        write(&a, "r1", "Soup");
        let other = SiteId::new();
        let mut rep_b = Replicator::new(b.site_id(), a.site_id(), 16, None);

        let mut out = Vec::new();
        rep_b.on_poke(&b, other, 1, &mut out);
        let (request_id, _, _) = request_of(&out[0]);

        let records = a.changes_since(a.site_id(), 0, None).unwrap();
        let err = rep_b
            .on_changes(&b, request_id, other, records, 1, &mut Vec::new())
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn test_expired_request_resent_with_new_id() {
        let local = MemoryStore::new(schema());
        let remote_site = SiteId::new();
        let mut rep = Replicator::new(
            local.site_id(),
            remote_site,
            16,
            Some(Duration::from_millis(10)),
        );
        let mut out = Vec::new();
        rep.on_poke(&local, remote_site, 3, &mut out);
        let (first_id, _, _) = request_of(&out[0]);

        let mut resent = Vec::new();
        rep.expired(&local, Instant::now(), &mut resent);
        assert!(resent.is_empty());

        rep.expired(&local, Instant::now() + Duration::from_millis(50), &mut resent);
        let (second_id, site, _) = request_of(&resent[0]);
        assert_ne!(first_id, second_id);
        assert_eq!(site, remote_site);
        assert_eq!(rep.pending_count(), 1);
    }

    #[test]
    fn test_on_open_skips_remote_site() {
        let a = MemoryStore::new(schema());
        let b = MemoryStore::new(schema());
        write(&b, "r1", "Soup");
        write(&a, "r2", "Stew");
        let records = b.changes_since(b.site_id(), 0, None).unwrap();
        a.apply(&records).unwrap();

        let rep = Replicator::new(a.site_id(), b.site_id(), 16, None);
        let mut out = Vec::new();
        rep.on_open(&a, &mut out);
        assert_eq!(out, vec![SyncMessage::poke(a.site_id(), 1)]);
    }
}
