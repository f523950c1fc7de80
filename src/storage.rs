//! Transactional event store over redb.
//!
//! Each keyspace of the durable layout is a named table; composite keys
//! are built in `keys` so bytewise order equals logical order. Every
//! public operation runs under a single transaction: snapshot-isolated
//! reads, serialisable read-write for mutations.

use std::io::{BufRead, Write};
use std::ops::Bound;
use std::path::Path;
use std::sync::Arc;

use rand::seq::SliceRandom;
use redb::{Database, ReadableTable, Table, TableDefinition, WriteTransaction};
use tracing::warn;

use crate::codec::{self, CodecError};
use crate::event::{Event, KindClass};
use crate::filter::Filter;
use crate::keys;
use crate::signer::Signer;

const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");
const IDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("ids");
const AUTHORS: TableDefinition<&[u8], ()> = TableDefinition::new("authors");
const KINDS: TableDefinition<&[u8], ()> = TableDefinition::new("kinds");
const AUTHOR_KINDS: TableDefinition<&[u8], ()> = TableDefinition::new("author_kinds");
const TAGS: TableDefinition<&[u8], ()> = TableDefinition::new("tags");
const TIMES: TableDefinition<&[u8], ()> = TableDefinition::new("times");
const REPLACEABLE: TableDefinition<&[u8], u64> = TableDefinition::new("replaceable");
const PARAM_REPLACEABLE: TableDefinition<&[u8], u64> =
    TableDefinition::new("param_replaceable");
const DELETED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("deleted");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SERIAL: &str = "next_serial";
const DB_FILE: &str = "events.redb";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table open failed: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage failed: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit failed: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("database open failed: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("bad event: {0}")]
    BadEvent(#[from] CodecError),
    #[error("corrupt record for serial {0}")]
    Corrupt(u64),
    #[error("event {0} failed verification")]
    VerifyFailed(String),
    #[error("serial space exhausted")]
    SerialExhausted,
}

impl StoreError {
    /// Whether a retry may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Transaction(_)
                | StoreError::Storage(_)
                | StoreError::Commit(_)
                | StoreError::Io(_)
        )
    }
}

/// Result of a write-path save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Persisted and indexed.
    Saved,
    /// Already present, nothing written.
    Duplicate,
    /// A newer event holds the replaceable slot.
    Older,
    /// Ephemeral kind, intentionally not persisted.
    Ephemeral,
}

/// Persistent, indexed event store rooted at a directory.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
}

/// All tables of one write transaction.
struct Tables<'txn> {
    events: Table<'txn, u64, &'static [u8]>,
    ids: Table<'txn, &'static [u8], &'static [u8]>,
    authors: Table<'txn, &'static [u8], ()>,
    kinds: Table<'txn, &'static [u8], ()>,
    author_kinds: Table<'txn, &'static [u8], ()>,
    tags: Table<'txn, &'static [u8], ()>,
    times: Table<'txn, &'static [u8], ()>,
    replaceable: Table<'txn, &'static [u8], u64>,
    param_replaceable: Table<'txn, &'static [u8], u64>,
    deleted: Table<'txn, &'static [u8], &'static [u8]>,
    meta: Table<'txn, &'static str, u64>,
}

/// The current winner loses to `new` on greater `created_at`, ties broken
/// by the lexicographically greater id.
fn newer_wins(new: &Event, current: &Event) -> bool {
    (new.created_at, new.id.as_str()) > (current.created_at, current.id.as_str())
}

impl<'txn> Tables<'txn> {
    fn open(txn: &'txn WriteTransaction) -> Result<Self, StoreError> {
        Ok(Self {
            events: txn.open_table(EVENTS)?,
            ids: txn.open_table(IDS)?,
            authors: txn.open_table(AUTHORS)?,
            kinds: txn.open_table(KINDS)?,
            author_kinds: txn.open_table(AUTHOR_KINDS)?,
            tags: txn.open_table(TAGS)?,
            times: txn.open_table(TIMES)?,
            replaceable: txn.open_table(REPLACEABLE)?,
            param_replaceable: txn.open_table(PARAM_REPLACEABLE)?,
            deleted: txn.open_table(DELETED)?,
            meta: txn.open_table(META)?,
        })
    }

    fn next_serial(&mut self) -> Result<u64, StoreError> {
        let next = self.meta.get(NEXT_SERIAL)?.map(|g| g.value()).unwrap_or(0);
        if next > keys::SERIAL_MAX {
            return Err(StoreError::SerialExhausted);
        }
        self.meta.insert(NEXT_SERIAL, next + 1)?;
        Ok(next)
    }

    fn fetch(&self, serial: u64) -> Result<Option<Event>, StoreError> {
        let Some(guard) = self.events.get(serial)? else {
            return Ok(None);
        };
        let ev = Event::from_record(guard.value()).map_err(|_| StoreError::Corrupt(serial))?;
        Ok(Some(ev))
    }

    fn serial_for(&self, id: &[u8; 32]) -> Result<Option<u64>, StoreError> {
        Ok(self
            .ids
            .get(id.as_slice())?
            .map(|g| keys::serial_from(&g.value()[..5])))
    }

    fn index_event(
        &mut self,
        ev: &Event,
        serial: u64,
        ph8: &[u8; 8],
    ) -> Result<(), StoreError> {
        self.authors
            .insert(keys::author_key(ph8, ev.created_at, serial).as_slice(), ())?;
        self.kinds
            .insert(keys::kind_key(ev.kind, ev.created_at, serial).as_slice(), ())?;
        self.author_kinds.insert(
            keys::author_kind_key(ph8, ev.kind, ev.created_at, serial).as_slice(),
            (),
        )?;
        self.times
            .insert(keys::time_key(ev.created_at, serial).as_slice(), ())?;
        for tag in &ev.tags {
            if !tag.is_indexable() {
                continue;
            }
            let Some(value) = tag.value() else { continue };
            let letter = tag.key().as_bytes()[0];
            self.tags.insert(
                keys::tag_key(letter, &keys::value_hash8(value), ev.created_at, serial)
                    .as_slice(),
                (),
            )?;
        }
        Ok(())
    }

    /// Remove the record and every secondary entry for `serial`; `ev` must
    /// be the decoded record stored under it.
    fn remove_serial(&mut self, serial: u64, ev: &Event) -> Result<(), StoreError> {
        self.events.remove(serial)?;
        self.ids.remove(ev.id_bytes()?.as_slice())?;
        let Some(ph8) = keys::pubkey_hash8(&ev.pubkey) else {
            return Err(StoreError::Corrupt(serial));
        };
        self.authors
            .remove(keys::author_key(&ph8, ev.created_at, serial).as_slice())?;
        self.kinds
            .remove(keys::kind_key(ev.kind, ev.created_at, serial).as_slice())?;
        self.author_kinds.remove(
            keys::author_kind_key(&ph8, ev.kind, ev.created_at, serial).as_slice(),
        )?;
        self.times
            .remove(keys::time_key(ev.created_at, serial).as_slice())?;
        for tag in &ev.tags {
            if !tag.is_indexable() {
                continue;
            }
            let Some(value) = tag.value() else { continue };
            let letter = tag.key().as_bytes()[0];
            self.tags.remove(
                keys::tag_key(letter, &keys::value_hash8(value), ev.created_at, serial)
                    .as_slice(),
            )?;
        }
        match ev.class() {
            KindClass::Replaceable => {
                let key = keys::replaceable_key(&ph8, ev.kind);
                if self.replaceable.get(key.as_slice())?.map(|g| g.value()) == Some(serial) {
                    self.replaceable.remove(key.as_slice())?;
                }
            }
            KindClass::ParamReplaceable => {
                let key = keys::param_replaceable_key(
                    &ph8,
                    ev.kind,
                    &keys::value_hash8(ev.d_tag()),
                );
                if self.param_replaceable.get(key.as_slice())?.map(|g| g.value())
                    == Some(serial)
                {
                    self.param_replaceable.remove(key.as_slice())?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn save_event(
        &mut self,
        ev: &Event,
        id: &[u8; 32],
        record: &[u8],
    ) -> Result<SaveOutcome, StoreError> {
        if self.ids.get(id.as_slice())?.is_some() {
            return Ok(SaveOutcome::Duplicate);
        }
        let serial = self.next_serial()?;
        let ph8 = keys::pubkey_hash8(&ev.pubkey)
            .ok_or(StoreError::BadEvent(CodecError::InvalidHex("pubkey")))?;
        match ev.class() {
            KindClass::Replaceable => {
                let key = keys::replaceable_key(&ph8, ev.kind);
                let cur_serial_opt = self.replaceable.get(key.as_slice())?.map(|g| g.value());
                if let Some(cur_serial) = cur_serial_opt {
                    if let Some(cur) = self.fetch(cur_serial)? {
                        if cur.pubkey == ev.pubkey {
                            if !newer_wins(ev, &cur) {
                                return Ok(SaveOutcome::Older);
                            }
                            self.remove_serial(cur_serial, &cur)?;
                        } else {
                            // pkh8 collision between distinct pubkeys
                            warn!(kind = ev.kind, "replaceable pointer collision");
                        }
                    }
                }
                self.replaceable.insert(key.as_slice(), serial)?;
            }
            KindClass::ParamReplaceable => {
                let key = keys::param_replaceable_key(
                    &ph8,
                    ev.kind,
                    &keys::value_hash8(ev.d_tag()),
                );
                let cur_serial_opt = self.param_replaceable.get(key.as_slice())?.map(|g| g.value());
                if let Some(cur_serial) = cur_serial_opt {
                    if let Some(cur) = self.fetch(cur_serial)? {
                        if cur.pubkey == ev.pubkey && cur.d_tag() == ev.d_tag() {
                            if !newer_wins(ev, &cur) {
                                return Ok(SaveOutcome::Older);
                            }
                            self.remove_serial(cur_serial, &cur)?;
                        } else {
                            warn!(kind = ev.kind, "parameterized pointer collision");
                        }
                    }
                }
                self.param_replaceable.insert(key.as_slice(), serial)?;
            }
            _ => {}
        }
        self.events.insert(serial, record)?;
        let mut id_value = Vec::with_capacity(45);
        id_value.extend_from_slice(&keys::serial_bytes(serial));
        id_value.extend_from_slice(&keys::ts_bytes(ev.created_at));
        id_value.extend_from_slice(&ev.pubkey_bytes()?);
        self.ids.insert(id.as_slice(), id_value.as_slice())?;
        self.index_event(ev, serial, &ph8)?;
        Ok(SaveOutcome::Saved)
    }
}

impl Store {
    /// Open (creating if needed) the store under `root`.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(root)?;
        let db = Database::create(root.join(DB_FILE))?;
        let txn = db.begin_write()?;
        Tables::open(&txn)?;
        txn.commit()?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Persist an event under the kind-class write rules.
    pub fn save(&self, ev: &Event) -> Result<SaveOutcome, StoreError> {
        if ev.class() == KindClass::Ephemeral {
            return Ok(SaveOutcome::Ephemeral);
        }
        let id = ev.id_bytes()?;
        let record = ev.to_record()?;
        let txn = self.db.begin_write()?;
        let outcome = {
            let mut tables = Tables::open(&txn)?;
            tables.save_event(ev, &id, &record)?
        };
        match outcome {
            SaveOutcome::Saved => txn.commit()?,
            _ => txn.abort()?,
        }
        Ok(outcome)
    }

    /// Fetch a single event by full hex id.
    pub fn get_by_id(&self, id_hex: &str) -> Result<Option<Event>, StoreError> {
        let id = codec::decode_hex::<32>(id_hex, "id")?;
        let txn = self.db.begin_read()?;
        let ids = txn.open_table(IDS)?;
        let Some(serial) = ids
            .get(id.as_slice())?
            .map(|g| keys::serial_from(&g.value()[..5]))
        else {
            return Ok(None);
        };
        let events = txn.open_table(EVENTS)?;
        let Some(guard) = events.get(serial)? else {
            return Ok(None);
        };
        let ev = Event::from_record(guard.value()).map_err(|_| StoreError::Corrupt(serial))?;
        Ok(Some(ev))
    }

    /// Query matching events, newest first, honouring `limit`.
    pub fn query(&self, filter: &Filter) -> Result<Vec<Event>, StoreError> {
        let mut out = Vec::new();
        if filter.limit == Some(0) {
            return Ok(out);
        }
        let limit = filter.limit;
        self.scan_matches(filter, |ev| {
            out.push(ev);
            match limit {
                Some(l) => out.len() < l,
                None => true,
            }
        })?;
        Ok(out)
    }

    /// Count matching events; `limit` is ignored.
    pub fn count(&self, filter: &Filter) -> Result<u64, StoreError> {
        let mut n = 0u64;
        self.scan_matches(filter, |_| {
            n += 1;
            true
        })?;
        Ok(n)
    }

    /// Walk candidates from the narrowest index, newest first, and feed
    /// surviving events to `visit` until it returns `false`.
    fn scan_matches(
        &self,
        filter: &Filter,
        mut visit: impl FnMut(Event) -> bool,
    ) -> Result<(), StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let ids = txn.open_table(IDS)?;
        let deleted = txn.open_table(DELETED)?;
        let replaceable = txn.open_table(REPLACEABLE)?;
        let param_replaceable = txn.open_table(PARAM_REPLACEABLE)?;

        fn collect_range(
            table: &redb::ReadOnlyTable<&'static [u8], ()>,
            prefix: &[u8],
            since: Option<i64>,
            until: Option<i64>,
            cands: &mut Vec<(i64, u64)>,
        ) -> Result<(), StoreError> {
            let (lo, hi) = keys::scan_bounds(prefix, since, until);
            let range = (Bound::Included(&lo[..]), Bound::Included(&hi[..]));
            for item in table.range::<&[u8]>(range)?.rev() {
                let (key, _) = item?;
                cands.push(keys::ts_serial_suffix(key.value()));
            }
            Ok(())
        }

        // (created_at, serial), filled by the chosen index.
        let mut cands: Vec<(i64, u64)> = Vec::new();

        let authors_usable = !filter.authors.is_empty()
            && filter.authors.iter().all(|a| a.len() >= 16);
        let index_tag = filter
            .tags
            .iter()
            .filter(|(letter, values)| letter.is_ascii() && !values.is_empty())
            .min_by_key(|(_, values)| values.len());

        if !filter.ids.is_empty() {
            for prefix in &filter.ids {
                let bytes =
                    hex::decode(prefix).map_err(|_| CodecError::InvalidHex("ids"))?;
                if bytes.len() == 32 {
                    if let Some(guard) = ids.get(bytes.as_slice())? {
                        let v = guard.value();
                        cands.push((keys::ts_from(&v[5..13]), keys::serial_from(&v[..5])));
                    }
                } else {
                    let (lo, hi) = keys::prefix_bounds(&bytes, 32);
                    let range = (Bound::Included(&lo[..]), Bound::Included(&hi[..]));
                    for item in ids.range::<&[u8]>(range)? {
                        let (_, guard) = item?;
                        let v = guard.value();
                        cands.push((keys::ts_from(&v[5..13]), keys::serial_from(&v[..5])));
                    }
                }
            }
        } else if authors_usable && !filter.kinds.is_empty() {
            let table = txn.open_table(AUTHOR_KINDS)?;
            for author in &filter.authors {
                let ph8 = keys::pubkey_hash8(author)
                    .ok_or(CodecError::InvalidHex("authors"))?;
                for &kind in &filter.kinds {
                    let mut prefix = ph8.to_vec();
                    prefix.extend_from_slice(&kind.to_be_bytes());
                    collect_range(&table, &prefix, filter.since, filter.until, &mut cands)?;
                }
            }
        } else if authors_usable {
            let table = txn.open_table(AUTHORS)?;
            for author in &filter.authors {
                let ph8 = keys::pubkey_hash8(author)
                    .ok_or(CodecError::InvalidHex("authors"))?;
                collect_range(&table, &ph8, filter.since, filter.until, &mut cands)?;
            }
        } else if !filter.kinds.is_empty() {
            let table = txn.open_table(KINDS)?;
            for &kind in &filter.kinds {
                collect_range(&table, &kind.to_be_bytes(), filter.since, filter.until, &mut cands)?;
            }
        } else if let Some((letter, values)) = index_tag {
            let table = txn.open_table(TAGS)?;
            for value in values {
                let mut prefix = vec![*letter as u8];
                prefix.extend_from_slice(&keys::value_hash8(value));
                collect_range(&table, &prefix, filter.since, filter.until, &mut cands)?;
            }
        } else {
            let table = txn.open_table(TIMES)?;
            collect_range(&table, &[], filter.since, filter.until, &mut cands)?;
        }

        // Newest first; same serial can surface from several prefixes.
        cands.sort_unstable_by(|a, b| b.cmp(a));
        cands.dedup_by_key(|c| c.1);

        for (_, serial) in cands {
            let Some(guard) = events.get(serial)? else {
                continue;
            };
            let ev =
                Event::from_record(guard.value()).map_err(|_| StoreError::Corrupt(serial))?;
            drop(guard);
            if !filter.matches(&ev) {
                continue;
            }
            if deleted.get(ev.id_bytes()?.as_slice())?.is_some() {
                continue;
            }
            // Tombstone check: hide stale replaceable losers.
            let stale = match ev.class() {
                KindClass::Replaceable => {
                    let ph8 = keys::pubkey_hash8(&ev.pubkey)
                        .ok_or(StoreError::Corrupt(serial))?;
                    replaceable
                        .get(keys::replaceable_key(&ph8, ev.kind).as_slice())?
                        .map(|g| g.value())
                        != Some(serial)
                }
                KindClass::ParamReplaceable => {
                    let ph8 = keys::pubkey_hash8(&ev.pubkey)
                        .ok_or(StoreError::Corrupt(serial))?;
                    param_replaceable
                        .get(
                            keys::param_replaceable_key(
                                &ph8,
                                ev.kind,
                                &keys::value_hash8(ev.d_tag()),
                            )
                            .as_slice(),
                        )?
                        .map(|g| g.value())
                        != Some(serial)
                }
                _ => false,
            };
            if stale {
                continue;
            }
            if !visit(ev) {
                break;
            }
        }
        Ok(())
    }

    /// Remove an event and all its index entries. Returns whether a
    /// record was removed.
    pub fn delete_event(&self, id_hex: &str) -> Result<bool, StoreError> {
        let id = codec::decode_hex::<32>(id_hex, "id")?;
        let txn = self.db.begin_write()?;
        let removed = {
            let mut tables = Tables::open(&txn)?;
            match tables.serial_for(&id)? {
                None => false,
                Some(serial) => match tables.fetch(serial)? {
                    Some(ev) => {
                        tables.remove_serial(serial, &ev)?;
                        true
                    }
                    None => {
                        tables.ids.remove(id.as_slice())?;
                        true
                    }
                },
            }
        };
        if removed {
            txn.commit()?;
        } else {
            txn.abort()?;
        }
        Ok(removed)
    }

    /// Record that `id_hex` was deleted by its author; the id is never
    /// re-accepted afterwards.
    pub fn mark_deleted(&self, id_hex: &str, author_hex: &str) -> Result<(), StoreError> {
        let id = codec::decode_hex::<32>(id_hex, "id")?;
        let author = codec::decode_hex::<32>(author_hex, "pubkey")?;
        let txn = self.db.begin_write()?;
        {
            let mut deleted = txn.open_table(DELETED)?;
            deleted.insert(id.as_slice(), author.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Whether the id carries a deletion marker.
    pub fn is_deleted(&self, id_hex: &str) -> Result<bool, StoreError> {
        let id = codec::decode_hex::<32>(id_hex, "id")?;
        let txn = self.db.begin_read()?;
        let deleted = txn.open_table(DELETED)?;
        Ok(deleted.get(id.as_slice())?.is_some())
    }

    /// Stream the full store (or the given authors' events) as NDJSON.
    pub fn export(
        &self,
        out: &mut dyn Write,
        authors: &[String],
    ) -> Result<u64, StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let deleted = txn.open_table(DELETED)?;
        let mut written = 0u64;
        let mut emit = |ev: &Event, out: &mut dyn Write| -> Result<(), StoreError> {
            out.write_all(codec::event_json(ev).as_bytes())?;
            out.write_all(b"\n")?;
            written += 1;
            Ok(())
        };
        if authors.is_empty() {
            for item in events.iter()? {
                let (key, value) = item?;
                let ev = Event::from_record(value.value())
                    .map_err(|_| StoreError::Corrupt(key.value()))?;
                if deleted.get(ev.id_bytes()?.as_slice())?.is_some() {
                    continue;
                }
                emit(&ev, out)?;
            }
        } else {
            let author_table = txn.open_table(AUTHORS)?;
            for author in authors {
                let ph8 = keys::pubkey_hash8(author)
                    .ok_or(CodecError::InvalidHex("pubkey"))?;
                let (lo, hi) = keys::scan_bounds(&ph8, None, None);
                let range = (Bound::Included(&lo[..]), Bound::Included(&hi[..]));
                for item in author_table.range::<&[u8]>(range)? {
                    let (key, _) = item?;
                    let (_, serial) = keys::ts_serial_suffix(key.value());
                    let Some(guard) = events.get(serial)? else { continue };
                    let ev = Event::from_record(guard.value())
                        .map_err(|_| StoreError::Corrupt(serial))?;
                    drop(guard);
                    if &ev.pubkey != author {
                        continue;
                    }
                    if deleted.get(ev.id_bytes()?.as_slice())?.is_some() {
                        continue;
                    }
                    emit(&ev, out)?;
                }
            }
        }
        Ok(written)
    }

    /// Consume line-delimited JSON events through the normal write path,
    /// verifying ids and signatures. Returns `(accepted, rejected)`.
    pub fn import(
        &self,
        reader: impl BufRead,
        signer: &dyn Signer,
    ) -> Result<(u64, u64), StoreError> {
        let mut accepted = 0u64;
        let mut rejected = 0u64;
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&line) else {
                rejected += 1;
                continue;
            };
            let Ok(ev) = codec::event_from_value(&value) else {
                rejected += 1;
                continue;
            };
            let id = codec::event_id(&ev);
            if hex::encode(id) != ev.id {
                rejected += 1;
                continue;
            }
            let (Ok(pubkey), Ok(sig)) = (ev.pubkey_bytes(), ev.sig_bytes()) else {
                rejected += 1;
                continue;
            };
            if !signer.verify(&pubkey, &id, &sig) {
                rejected += 1;
                continue;
            }
            if self.is_deleted(&ev.id)? {
                rejected += 1;
                continue;
            }
            match self.save(&ev)? {
                SaveOutcome::Saved => accepted += 1,
                _ => rejected += 1,
            }
        }
        Ok((accepted, rejected))
    }

    /// Re-verify a random sample of stored events. Errors on the first
    /// failure.
    pub fn verify_sample(
        &self,
        signer: &dyn Signer,
        sample: usize,
    ) -> Result<usize, StoreError> {
        let txn = self.db.begin_read()?;
        let events = txn.open_table(EVENTS)?;
        let mut serials = Vec::new();
        for item in events.iter()? {
            let (key, _) = item?;
            serials.push(key.value());
        }
        serials.shuffle(&mut rand::thread_rng());
        let take = sample.min(serials.len());
        for &serial in serials.iter().take(take) {
            let Some(guard) = events.get(serial)? else { continue };
            let ev =
                Event::from_record(guard.value()).map_err(|_| StoreError::Corrupt(serial))?;
            drop(guard);
            let id = codec::event_id(&ev);
            if hex::encode(id) != ev.id {
                return Err(StoreError::VerifyFailed(ev.id));
            }
            let (pubkey, sig) = (ev.pubkey_bytes()?, ev.sig_bytes()?);
            if !signer.verify(&pubkey, &id, &sig) {
                return Err(StoreError::VerifyFailed(ev.id));
            }
        }
        Ok(take)
    }

    /// Drop and rebuild every secondary table from the event records.
    /// Surviving replaceable losers are hidden by the query tombstone
    /// checks, not removed.
    pub fn reindex(&self) -> Result<(), StoreError> {
        let txn = self.db.begin_write()?;
        txn.delete_table(IDS)?;
        for def in [AUTHORS, KINDS, AUTHOR_KINDS, TAGS, TIMES] {
            txn.delete_table(def)?;
        }
        txn.delete_table(REPLACEABLE)?;
        txn.delete_table(PARAM_REPLACEABLE)?;
        {
            let mut tables = Tables::open(&txn)?;
            let mut serials = Vec::new();
            for item in tables.events.iter()? {
                let (key, _) = item?;
                serials.push(key.value());
            }
            for serial in serials {
                let Some(ev) = tables.fetch(serial)? else { continue };
                let id = ev.id_bytes()?;
                let ph8 = keys::pubkey_hash8(&ev.pubkey)
                    .ok_or(StoreError::Corrupt(serial))?;
                let mut id_value = Vec::with_capacity(45);
                id_value.extend_from_slice(&keys::serial_bytes(serial));
                id_value.extend_from_slice(&keys::ts_bytes(ev.created_at));
                id_value.extend_from_slice(&ev.pubkey_bytes()?);
                tables.ids.insert(id.as_slice(), id_value.as_slice())?;
                tables.index_event(&ev, serial, &ph8)?;
                match ev.class() {
                    KindClass::Replaceable => {
                        let key = keys::replaceable_key(&ph8, ev.kind);
                        let cur = tables
                            .replaceable
                            .get(key.as_slice())?
                            .map(|g| g.value());
                        let wins = match cur {
                            None => true,
                            Some(cur_serial) => match tables.fetch(cur_serial)? {
                                Some(cur_ev) => newer_wins(&ev, &cur_ev),
                                None => true,
                            },
                        };
                        if wins {
                            tables.replaceable.insert(key.as_slice(), serial)?;
                        }
                    }
                    KindClass::ParamReplaceable => {
                        let key = keys::param_replaceable_key(
                            &ph8,
                            ev.kind,
                            &keys::value_hash8(ev.d_tag()),
                        );
                        let cur = tables
                            .param_replaceable
                            .get(key.as_slice())?
                            .map(|g| g.value());
                        let wins = match cur {
                            None => true,
                            Some(cur_serial) => match tables.fetch(cur_serial)? {
                                Some(cur_ev) => newer_wins(&ev, &cur_ev),
                                None => true,
                            },
                        };
                        if wins {
                            tables.param_replaceable.insert(key.as_slice(), serial)?;
                        }
                    }
                    _ => {}
                }
            }
        }
        txn.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Tag;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let dir = TempDir::new().unwrap();
        let store = Store::open(dir.path()).unwrap();
        (dir, store)
    }

    fn sample(pubkey: &str, kind: u16, created_at: i64, tags: Vec<Tag>) -> Event {
        let mut ev = Event {
            id: String::new(),
            pubkey: pubkey.into(),
            created_at,
            kind,
            tags,
            content: String::new(),
            sig: "00".repeat(64),
        };
        ev.id = codec::event_id_hex(&ev);
        ev
    }

    fn pk(byte: u8) -> String {
        hex::encode([byte; 32])
    }

    #[test]
    fn save_and_query_by_author() {
        let (_dir, store) = store();
        let ev = sample(&pk(1), 1, 10, vec![]);
        assert_eq!(store.save(&ev).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.save(&ev).unwrap(), SaveOutcome::Duplicate);
        let got = store
            .query(&Filter { authors: vec![pk(1)], ..Filter::default() })
            .unwrap();
        assert_eq!(got, vec![ev]);
    }

    #[test]
    fn query_newest_first_with_limit() {
        let (_dir, store) = store();
        for ts in 1..=5 {
            store
                .save(&sample(&pk(1), 1, ts, vec![]))
                .unwrap();
        }
        let got = store
            .query(&Filter {
                kinds: vec![1],
                limit: Some(3),
                ..Filter::default()
            })
            .unwrap();
        let times: Vec<i64> = got.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![5, 4, 3]);
    }

    #[test]
    fn query_since_until_bounds_are_inclusive() {
        let (_dir, store) = store();
        for ts in 1..=5 {
            store.save(&sample(&pk(1), 1, ts, vec![])).unwrap();
        }
        let got = store
            .query(&Filter {
                since: Some(2),
                until: Some(4),
                ..Filter::default()
            })
            .unwrap();
        let times: Vec<i64> = got.iter().map(|e| e.created_at).collect();
        assert_eq!(times, vec![4, 3, 2]);
    }

    #[test]
    fn query_by_id_prefix() {
        let (_dir, store) = store();
        let ev = sample(&pk(1), 1, 10, vec![]);
        store.save(&ev).unwrap();
        let prefix = ev.id[..8].to_string();
        let got = store
            .query(&Filter { ids: vec![prefix], ..Filter::default() })
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, ev.id);
        let got = store
            .query(&Filter { ids: vec![ev.id.clone()], ..Filter::default() })
            .unwrap();
        assert_eq!(got.len(), 1);
    }

    #[test]
    fn query_by_tag_value() {
        let (_dir, store) = store();
        let tagged = sample(
            &pk(1),
            1,
            10,
            vec![Tag(vec!["t".into(), "essay".into()])],
        );
        let other = sample(&pk(1), 1, 11, vec![Tag(vec!["t".into(), "art".into()])]);
        store.save(&tagged).unwrap();
        store.save(&other).unwrap();
        let mut tags = BTreeMap::new();
        tags.insert('t', vec!["essay".to_string()]);
        let got = store.query(&Filter { tags, ..Filter::default() }).unwrap();
        assert_eq!(got, vec![tagged]);
    }

    #[test]
    fn replaceable_keeps_newest() {
        let (_dir, store) = store();
        let old = sample(&pk(1), 0, 100, vec![]);
        let new = sample(&pk(1), 0, 200, vec![]);
        store.save(&old).unwrap();
        assert_eq!(store.save(&new).unwrap(), SaveOutcome::Saved);
        assert_eq!(store.save(&old).unwrap(), SaveOutcome::Older);
        let got = store
            .query(&Filter {
                authors: vec![pk(1)],
                kinds: vec![0],
                ..Filter::default()
            })
            .unwrap();
        assert_eq!(got, vec![new]);
        // the loser's record is fully gone
        assert!(store.get_by_id(&old.id).unwrap().is_none());
    }

    #[test]
    fn replaceable_tie_breaks_on_greater_id() {
        let (_dir, store) = store();
        let a = sample(&pk(1), 10002, 100, vec![Tag(vec!["r".into(), "a".into()])]);
        let b = sample(&pk(1), 10002, 100, vec![Tag(vec!["r".into(), "b".into()])]);
        let (winner, loser) = if a.id > b.id { (a, b) } else { (b, a) };
        store.save(&loser).unwrap();
        assert_eq!(store.save(&winner).unwrap(), SaveOutcome::Saved);
        let got = store
            .query(&Filter { kinds: vec![10002], ..Filter::default() })
            .unwrap();
        assert_eq!(got, vec![winner.clone()]);
        // and in the other insertion order the winner still holds the slot
        let dir2 = TempDir::new().unwrap();
        let store2 = Store::open(dir2.path()).unwrap();
        store2.save(&winner).unwrap();
        assert_eq!(store2.save(&loser).unwrap(), SaveOutcome::Older);
    }

    #[test]
    fn param_replaceable_is_keyed_by_d_tag() {
        let (_dir, store) = store();
        let d = |v: &str| vec![Tag(vec!["d".into(), v.into()])];
        let a1 = sample(&pk(1), 30023, 1, d("a"));
        let a2 = sample(&pk(1), 30023, 2, d("a"));
        let b1 = sample(&pk(1), 30023, 1, d("b"));
        store.save(&a1).unwrap();
        store.save(&b1).unwrap();
        store.save(&a2).unwrap();
        let got = store
            .query(&Filter {
                authors: vec![pk(1)],
                kinds: vec![30023],
                ..Filter::default()
            })
            .unwrap();
        assert_eq!(got.len(), 2);
        assert!(got.contains(&a2));
        assert!(got.contains(&b1));
        assert!(store.get_by_id(&a1.id).unwrap().is_none());
    }

    #[test]
    fn ephemeral_is_not_persisted() {
        let (_dir, store) = store();
        let ev = sample(&pk(1), 20001, 1, vec![]);
        assert_eq!(store.save(&ev).unwrap(), SaveOutcome::Ephemeral);
        assert!(store.get_by_id(&ev.id).unwrap().is_none());
        assert!(store
            .query(&Filter { kinds: vec![20001], ..Filter::default() })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn delete_event_removes_all_entries() {
        let (_dir, store) = store();
        let ev = sample(
            &pk(1),
            1,
            10,
            vec![Tag(vec!["t".into(), "essay".into()])],
        );
        store.save(&ev).unwrap();
        assert!(store.delete_event(&ev.id).unwrap());
        assert!(!store.delete_event(&ev.id).unwrap());
        assert!(store.get_by_id(&ev.id).unwrap().is_none());
        for f in [
            Filter { authors: vec![pk(1)], ..Filter::default() },
            Filter { kinds: vec![1], ..Filter::default() },
            Filter::default(),
        ] {
            assert!(store.query(&f).unwrap().is_empty());
        }
    }

    #[test]
    fn deletion_marker_hides_and_blocks() {
        let (_dir, store) = store();
        let ev = sample(&pk(1), 1, 10, vec![]);
        store.save(&ev).unwrap();
        store.mark_deleted(&ev.id, &pk(1)).unwrap();
        assert!(store.is_deleted(&ev.id).unwrap());
        // still present as a record, but never surfaced
        assert!(store
            .query(&Filter { kinds: vec![1], ..Filter::default() })
            .unwrap()
            .is_empty());
    }

    #[test]
    fn count_ignores_limit() {
        let (_dir, store) = store();
        for ts in 1..=4 {
            store.save(&sample(&pk(1), 1, ts, vec![])).unwrap();
        }
        let f = Filter { kinds: vec![1], limit: Some(1), ..Filter::default() };
        assert_eq!(store.count(&f).unwrap(), 4);
    }

    #[test]
    fn export_import_round_trip() {
        use crate::signer::default_signer;
        let signer = default_signer();
        let (_dir, store) = store();
        // import requires real signatures
        let (sec, pubkey) = signer.generate().unwrap();
        let mut signed = Vec::new();
        for ts in 1..=3 {
            let mut ev = Event {
                id: String::new(),
                pubkey: hex::encode(pubkey),
                created_at: ts,
                kind: 1,
                tags: vec![Tag(vec!["t".into(), "x".into()])],
                content: format!("n{ts}"),
                sig: String::new(),
            };
            let id = codec::event_id(&ev);
            ev.id = hex::encode(id);
            ev.sig = hex::encode(signer.sign(&sec, &id).unwrap());
            store.save(&ev).unwrap();
            signed.push(ev);
        }
        let mut dump = Vec::new();
        assert_eq!(store.export(&mut dump, &[]).unwrap(), 3);

        let dir2 = TempDir::new().unwrap();
        let store2 = Store::open(dir2.path()).unwrap();
        let (accepted, rejected) =
            store2.import(std::io::Cursor::new(dump), signer.as_ref()).unwrap();
        assert_eq!((accepted, rejected), (3, 0));
        for ev in &signed {
            assert_eq!(store2.get_by_id(&ev.id).unwrap().as_ref(), Some(ev));
        }
        let f = Filter { kinds: vec![1], ..Filter::default() };
        assert_eq!(store.query(&f).unwrap(), store2.query(&f).unwrap());
    }

    #[test]
    fn export_by_author_filters() {
        let (_dir, store) = store();
        store.save(&sample(&pk(1), 1, 1, vec![])).unwrap();
        store.save(&sample(&pk(2), 1, 2, vec![])).unwrap();
        let mut dump = Vec::new();
        assert_eq!(store.export(&mut dump, &[pk(1)]).unwrap(), 1);
        let text = String::from_utf8(dump).unwrap();
        assert!(text.contains(&pk(1)));
        assert!(!text.contains(&pk(2)));
    }

    #[test]
    fn import_rejects_tampered_events() {
        use crate::signer::default_signer;
        let signer = default_signer();
        let (_dir, store) = store();
        let (sec, pubkey) = signer.generate().unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "x".into(),
            sig: String::new(),
        };
        let id = codec::event_id(&ev);
        ev.id = hex::encode(id);
        ev.sig = hex::encode(signer.sign(&sec, &id).unwrap());
        let mut bad = ev.clone();
        bad.content = "tampered".into();
        let dump = format!("{}\n{}\n", codec::event_json(&ev), codec::event_json(&bad));
        let (accepted, rejected) = store
            .import(std::io::Cursor::new(dump.into_bytes()), signer.as_ref())
            .unwrap();
        assert_eq!((accepted, rejected), (1, 1));
    }

    #[test]
    fn verify_sample_flags_corruption() {
        use crate::signer::default_signer;
        let signer = default_signer();
        let (_dir, store) = store();
        let (sec, pubkey) = signer.generate().unwrap();
        let mut ev = Event {
            id: String::new(),
            pubkey: hex::encode(pubkey),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: String::new(),
            sig: String::new(),
        };
        let id = codec::event_id(&ev);
        ev.id = hex::encode(id);
        ev.sig = hex::encode(signer.sign(&sec, &id).unwrap());
        store.save(&ev).unwrap();
        assert_eq!(store.verify_sample(signer.as_ref(), 10).unwrap(), 1);

        let mut forged = ev.clone();
        forged.content = "forged".into();
        forged.id = codec::event_id_hex(&forged);
        store.save(&forged).unwrap();
        assert!(store.verify_sample(signer.as_ref(), 10).is_err());
    }

    #[test]
    fn reindex_rebuilds_queries() {
        let (_dir, store) = store();
        let plain = sample(&pk(1), 1, 5, vec![Tag(vec!["t".into(), "x".into()])]);
        let old = sample(&pk(2), 0, 10, vec![]);
        let new = sample(&pk(2), 0, 20, vec![]);
        store.save(&plain).unwrap();
        store.save(&old).unwrap();
        store.save(&new).unwrap();
        store.reindex().unwrap();
        let got = store
            .query(&Filter { authors: vec![pk(1)], ..Filter::default() })
            .unwrap();
        assert_eq!(got, vec![plain]);
        let got = store
            .query(&Filter {
                authors: vec![pk(2)],
                kinds: vec![0],
                ..Filter::default()
            })
            .unwrap();
        assert_eq!(got, vec![new]);
    }

    #[test]
    fn author_prefix_shorter_than_hash_still_matches() {
        let (_dir, store) = store();
        let ev = sample(&pk(0xab), 1, 1, vec![]);
        store.save(&ev).unwrap();
        // 4-char prefix cannot use the author index; falls back and
        // post-filters.
        let got = store
            .query(&Filter { authors: vec!["abab".into()], ..Filter::default() })
            .unwrap();
        assert_eq!(got, vec![ev]);
    }

    #[test]
    fn serials_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = Store::open(dir.path()).unwrap();
            store.save(&sample(&pk(1), 1, 1, vec![])).unwrap();
        }
        let store = Store::open(dir.path()).unwrap();
        store.save(&sample(&pk(1), 1, 2, vec![])).unwrap();
        let got = store.query(&Filter { kinds: vec![1], ..Filter::default() }).unwrap();
        assert_eq!(got.len(), 2);
    }
}
