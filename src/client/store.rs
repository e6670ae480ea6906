//! List state kept in sync with fetches and pushed changes.
//!
//! Every page carries the revision it was read at. Pushed events at or
//! below that revision are already in the page. Events that arrive while a
//! fetch is in flight wait in a buffer and are replayed on top of the
//! response. Per-record revisions drop anything older than what we hold.

use serde::de::DeserializeOwned;
use std::collections::HashMap;
use uuid::Uuid;

use super::realtime::ChangeEvent;
use super::ClientError;
use crate::entities::{CodeRecord, Task};
use crate::filter::{self, EvalContext, Expr, FilterError};
use crate::query::ListResult;
use crate::world::Action;

/// Anything a list holds.
pub trait Identified {
    fn id(&self) -> Uuid;
}

impl Identified for Task {
    fn id(&self) -> Uuid {
        self.id
    }
}

impl Identified for CodeRecord {
    fn id(&self) -> Uuid {
        self.id
    }
}

/// Where created records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Front,
    Back,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Apply pushed changes in place.
    Patch,
    /// Mark the list stale and let the owner refetch.
    Invalidate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Inserted,
    Replaced,
    Removed,
    /// Held until the in-flight fetch lands.
    Buffered,
    /// Already reflected, older than what we have, or not ours.
    Ignored,
    /// The list needs a refetch.
    Invalidated,
}

#[derive(Debug)]
pub struct ListStore<T> {
    pub items: Vec<T>,
    pub total_items: i64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: i64,
    pub loading: bool,
    /// Last user-facing error; cleared by the next fetch.
    pub error: Option<String>,

    placement: Placement,
    mode: SyncMode,
    filter: Option<Expr>,
    auth_id: Option<Uuid>,
    next_ticket: u64,
    in_flight: Option<Ticket>,
    page_revision: u64,
    pending: Vec<ChangeEvent>,
    revisions: HashMap<Uuid, u64>,
    stale: bool,
}

impl<T: Identified + DeserializeOwned> ListStore<T> {
    pub fn new(placement: Placement, mode: SyncMode) -> Self {
        ListStore {
            items: Vec::new(),
            total_items: 0,
            page: 1,
            per_page: 20,
            total_pages: 1,
            loading: false,
            error: None,
            placement,
            mode,
            filter: None,
            auth_id: None,
            next_ticket: 0,
            in_flight: None,
            page_revision: 0,
            pending: Vec::new(),
            revisions: HashMap::new(),
            stale: true,
        }
    }

    /// The filter pushed records must match, in the server's language.
    pub fn set_filter(&mut self, filter: &str) -> Result<(), FilterError> {
        self.filter = filter::parse(filter)?;
        self.stale = true;
        Ok(())
    }

    /// Who `@request.auth.id` refers to in the active filter.
    pub fn set_auth_id(&mut self, auth_id: Option<Uuid>) {
        self.auth_id = auth_id;
    }

    pub fn needs_refetch(&self) -> bool {
        self.stale
    }

    /// The revision of the last applied page; pass as `since` when
    /// resubscribing.
    pub fn revision(&self) -> u64 {
        self.page_revision
    }

    pub fn begin_fetch(&mut self) -> Ticket {
        self.next_ticket += 1;
        let ticket = Ticket(self.next_ticket);
        self.in_flight = Some(ticket);
        self.loading = true;
        self.error = None;
        ticket
    }

    /// Land a fetch. Returns false when a newer fetch superseded it.
    pub fn finish_fetch(&mut self, ticket: Ticket, result: Result<ListResult<T>, ClientError>) -> bool {
        if self.in_flight != Some(ticket) {
            return false;
        }
        self.in_flight = None;
        self.loading = false;

        match result {
            Ok(page) => {
                self.revisions = page.items.iter().map(|item| (item.id(), page.revision)).collect();
                self.items = page.items;
                self.total_items = page.total_items;
                self.page = page.page;
                self.per_page = page.per_page;
                self.total_pages = page.total_pages;
                self.page_revision = page.revision;
                self.stale = false;
            }
            Err(e) => self.error = Some(e.user_message()),
        }

        for event in std::mem::take(&mut self.pending) {
            self.apply_now(event);
        }
        true
    }

    /// Merge a pushed change.
    pub fn apply(&mut self, event: ChangeEvent) -> SyncOutcome {
        if self.in_flight.is_some() {
            self.pending.push(event);
            return SyncOutcome::Buffered;
        }
        self.apply_now(event)
    }

    /// Pushed events were lost.
    pub fn resync(&mut self) {
        self.stale = true;
    }

    /// Record a failed mutation; the list itself is left alone.
    pub fn settle<R>(&mut self, result: Result<R, ClientError>) -> Option<R> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.error = Some(e.user_message());
                None
            }
        }
    }

    /// `@now` is read at match time.
    fn matches(&self, event: &ChangeEvent) -> bool {
        self.filter
            .as_ref()
            .map_or(true, |f| f.matches(&event.record, &EvalContext::new(self.auth_id)))
    }

    fn position(&self, id: Uuid) -> Option<usize> {
        self.items.iter().position(|item| item.id() == id)
    }

    fn insert(&mut self, item: T) {
        match self.placement {
            Placement::Front => self.items.insert(0, item),
            Placement::Back => self.items.push(item),
        }
        if self.per_page > 0 {
            self.items.truncate(self.per_page as usize);
        }
        // A negative total means the page was fetched without counting
        if self.total_items >= 0 {
            self.total_items += 1;
        }
        self.recount_pages();
    }

    fn remove(&mut self, index: usize) {
        self.items.remove(index);
        if self.total_items > 0 {
            self.total_items -= 1;
        }
        self.recount_pages();
    }

    fn recount_pages(&mut self) {
        if self.per_page > 0 && self.total_items >= 0 {
            self.total_pages = (self.total_items + self.per_page as i64 - 1) / self.per_page as i64;
        }
    }

    fn apply_now(&mut self, event: ChangeEvent) -> SyncOutcome {
        if event.revision <= self.page_revision {
            return SyncOutcome::Ignored;
        }
        let Some(id) = event.record_id() else {
            return SyncOutcome::Ignored;
        };
        if self.revisions.get(&id).is_some_and(|rev| *rev >= event.revision) {
            return SyncOutcome::Ignored;
        }
        self.revisions.insert(id, event.revision);

        if self.mode == SyncMode::Invalidate {
            self.stale = true;
            return SyncOutcome::Invalidated;
        }

        let matches = self.matches(&event);
        let position = self.position(id);
        if event.action == Action::Delete {
            return match position {
                Some(index) => {
                    self.remove(index);
                    SyncOutcome::Removed
                }
                None => SyncOutcome::Ignored,
            };
        }

        let item = match serde_json::from_value::<T>(event.record) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, %id, "pushed record did not decode");
                return SyncOutcome::Ignored;
            }
        };
        match (event.action, position, matches) {
            (Action::Create, None, true) | (Action::Update, None, true) => {
                self.insert(item);
                SyncOutcome::Inserted
            }
            (Action::Update, Some(index), true) => {
                self.items[index] = item;
                SyncOutcome::Replaced
            }
            (Action::Update, Some(index), false) => {
                self.remove(index);
                SyncOutcome::Removed
            }
            _ => SyncOutcome::Ignored,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────
