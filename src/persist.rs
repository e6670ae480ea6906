//! World ↔ redb persistence.
//!
//! redb is a save file: loaded on boot, flushed on every applied event.
//! Never queried at runtime; World is the runtime truth.

use crate::entities::{CodeRecord, Collection, Record, User, UserStatus};
use crate::world::{Event, World};
use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
#[cfg(feature = "profile")]
use std::time::Instant;
use uuid::Uuid;

const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

pub const ADMIN_ROLE: &str = "admin";
pub const MEMBER_ROLE: &str = "member";

/// Roles every installation starts with: (code, display name).
pub const DEFAULT_ROLES: [(&str, &str); 4] = [
    (ADMIN_ROLE, "Administrator"),
    (MEMBER_ROLE, "Member"),
    ("group_leader", "Group Leader"),
    ("department_leader", "Department Leader"),
];

/// One table per collection, keyed by record id.
fn table(collection: Collection) -> TableDefinition<'static, &'static [u8], &'static [u8]> {
    TableDefinition::new(collection.as_str())
}

fn encode(record: &Record) -> Result<Vec<u8>, SaveFileError> {
    postcard::to_allocvec(record).map_err(|e| SaveFileError::Encode(e.to_string()))
}

/// Thin handle to the redb file. Cloneable (Arc inside).
#[derive(Clone)]
pub struct SaveFile {
    db: Arc<Database>,
}

impl SaveFile {
    /// Open (or create) the save file and make sure every table exists.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SaveFileError> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        {
            for collection in Collection::ALL {
                let _ = txn.open_table(table(collection))?;
            }
            let _ = txn.open_table(META)?;
        }
        txn.commit()?;

        Ok(SaveFile { db: Arc::new(db) })
    }

    /// Load the entire World from disk. Called once at boot.
    pub fn load_world(&self) -> Result<World, SaveFileError> {
        let mut world = World::new();
        let txn = self.db.begin_read()?;

        for collection in Collection::ALL {
            let records = txn.open_table(table(collection))?;
            for entry in records.iter()? {
                let (_, value) = entry?;
                let record: Record = postcard::from_bytes(value.value())
                    .map_err(|e| SaveFileError::Decode(e.to_string()))?;
                if record.collection() != collection {
                    return Err(SaveFileError::Decode(format!(
                        "{} record stored in {collection}",
                        record.collection()
                    )));
                }
                world.insert_record(record);
            }
        }

        let meta = txn.open_table(META)?;
        if let Some(rev) = meta.get("revision")? {
            if let Ok(bytes) = <[u8; 8]>::try_from(rev.value()) {
                world.revision = u64::from_le_bytes(bytes);
            }
        }

        Ok(world)
    }

    /// Flush a single event to disk. Called after every World::apply().
    /// Writes the affected record + updated revision in one transaction.
    pub fn flush(&self, world: &World, event: &Event) -> Result<(), SaveFileError> {
        #[cfg(feature = "profile")]
        let total_start = Instant::now();
        let record = event.record();
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(table(record.collection()))?;
            let mut meta = txn.open_table(META)?;

            match event {
                Event::Created { .. } | Event::Updated { .. } => {
                    let bytes = encode(record)?;
                    records.insert(record.id().as_bytes().as_slice(), bytes.as_slice())?;
                }
                Event::Deleted { .. } => {
                    records.remove(record.id().as_bytes().as_slice())?;
                }
            }

            meta.insert("revision", world.revision.to_le_bytes().as_slice())?;
        }
        txn.commit()?;
        #[cfg(feature = "profile")]
        tracing::debug!(
            collection = %record.collection(),
            total_us = total_start.elapsed().as_micros() as u64,
            "flush committed transaction"
        );
        Ok(())
    }

    /// Write a record without going through an event (seeding).
    pub fn save_record(&self, record: &Record) -> Result<(), SaveFileError> {
        let txn = self.db.begin_write()?;
        {
            let mut records = txn.open_table(table(record.collection()))?;
            let bytes = encode(record)?;
            records.insert(record.id().as_bytes().as_slice(), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Seed the default roles that are missing. Returns how many were created.
    pub fn ensure_default_roles(&self, world: &mut World) -> Result<usize, SaveFileError> {
        let mut created = 0;
        for (code, name) in DEFAULT_ROLES {
            if world.role_by_code(code).is_some() {
                continue;
            }
            let now = Utc::now();
            let record = Record::Role(CodeRecord {
                id: Uuid::new_v4(),
                name: name.to_string(),
                code: code.to_string(),
                created: now,
                updated: now,
            });
            self.save_record(&record)?;
            world.insert_record(record);
            created += 1;
        }
        Ok(created)
    }

    /// Seed an admin account if no users exist. Returns true if created.
    pub fn ensure_default_user(&self, world: &mut World, email: &str, password: &str) -> Result<bool, SaveFileError> {
        if !world.users.is_empty() {
            return Ok(false);
        }

        let password_hash =
            crate::auth::hash_password(password).map_err(|e| SaveFileError::Seed(e.to_string()))?;
        let roles = world.role_by_code(ADMIN_ROLE).map(|r| vec![r.id]).unwrap_or_default();
        let username = email.split('@').next().unwrap_or("admin").to_string();
        let now = Utc::now();

        let record = Record::User(User {
            id: Uuid::new_v4(),
            name: "Administrator".to_string(),
            username,
            email: email.to_string(),
            phone_number: String::new(),
            avatar: String::new(),
            status: UserStatus::Active,
            roles,
            verified: true,
            password_hash,
            created: now,
            updated: now,
        });

        self.save_record(&record)?;
        world.insert_record(record);
        Ok(true)
    }
}

// ── Errors ─────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SaveFileError {
    Redb(String),
    Decode(String),
    Encode(String),
    Seed(String),
}

// redb 2.x has many error types. Blanket them all into SaveFileError::Redb.
macro_rules! from_redb {
    ($($t:ty),*) => {
        $(impl From<$t> for SaveFileError {
            fn from(e: $t) -> Self { SaveFileError::Redb(e.to_string()) }
        })*
    };
}

from_redb!(
    redb::Error,
    redb::DatabaseError,
    redb::TableError,
    redb::TransactionError,
    redb::StorageError,
    redb::CommitError
);

impl std::fmt::Display for SaveFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SaveFileError::Redb(e) => write!(f, "redb: {e}"),
            SaveFileError::Decode(e) => write!(f, "decode: {e}"),
            SaveFileError::Encode(e) => write!(f, "encode: {e}"),
            SaveFileError::Seed(e) => write!(f, "seed: {e}"),
        }
    }
}

impl std::error::Error for SaveFileError {}

// ── Tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dto::{CodeInput, TaskInput};
    use crate::world::{Actor, Command, RecordInput};
    use std::fs;
    use std::path::PathBuf;

    /// Throwaway save file in the temp dir.
    fn temp_save(name: &str) -> (SaveFile, PathBuf) {
        let path = std::env::temp_dir().join(format!("taskdesk_test_{name}_{}.redb", std::process::id()));
        let _ = fs::remove_file(&path);
        let sf = SaveFile::open(&path).unwrap();
        (sf, path)
    }

    fn cleanup(path: &Path) {
        let _ = fs::remove_file(path);
    }

    #[test]
    fn round_trip_empty_world() {
        let (sf, path) = temp_save("empty");

        let world = sf.load_world().unwrap();
        assert!(world.tasks.is_empty());
        assert!(world.users.is_empty());
        assert_eq!(world.revision, 0);

        cleanup(&path);
    }

    #[test]
    fn seed_and_reload() {
        let (sf, path) = temp_save("seed");

        let mut world = sf.load_world().unwrap();
        assert_eq!(sf.ensure_default_roles(&mut world).unwrap(), 4);
        assert!(sf.ensure_default_user(&mut world, "admin@example.com", "changeme123").unwrap());

        let world2 = sf.load_world().unwrap();
        assert_eq!(world2.roles.len(), 4);
        assert_eq!(world2.users.len(), 1);
        let admin = world2.get_user_by_identity("admin").unwrap();
        assert!(world2.is_superuser(admin.id));
        assert!(crate::auth::verify_password("changeme123", &admin.password_hash));

        // Seeding again is a no-op
        let mut world3 = sf.load_world().unwrap();
        assert_eq!(sf.ensure_default_roles(&mut world3).unwrap(), 0);
        assert!(!sf.ensure_default_user(&mut world3, "admin@example.com", "x").unwrap());

        cleanup(&path);
    }

    #[test]
    fn flush_and_reload_records() {
        let (sf, path) = temp_save("records");
        let mut world = sf.load_world().unwrap();

        let event = world
            .apply(
                Command::Create {
                    input: RecordInput::Department(CodeInput {
                        name: Some("Ops".into()),
                        code: Some("OPS".into()),
                    }),
                },
                Actor::system(),
            )
            .unwrap();
        sf.flush(&world, &event).unwrap();
        let dept = event.record().id();

        let event = world
            .apply(
                Command::Create {
                    input: RecordInput::Task(TaskInput {
                        title: Some("Audit".into()),
                        departments: Some(vec![dept]),
                        ..Default::default()
                    }),
                },
                Actor::system(),
            )
            .unwrap();
        sf.flush(&world, &event).unwrap();
        let task = event.record().id();

        let world2 = sf.load_world().unwrap();
        assert_eq!(world2.revision, 2);
        assert_eq!(world2.tasks[&task].departments, vec![dept]);
        assert_eq!(world2.departments[&dept].code, "OPS");

        cleanup(&path);
    }

    #[test]
    fn delete_removes_from_disk() {
        let (sf, path) = temp_save("delete");
        let mut world = sf.load_world().unwrap();

        let event = world
            .apply(
                Command::Create {
                    input: RecordInput::Task(TaskInput { title: Some("Doomed".into()), ..Default::default() }),
                },
                Actor::system(),
            )
            .unwrap();
        sf.flush(&world, &event).unwrap();
        let id = event.record().id();

        let event = world
            .apply(Command::Delete { collection: Collection::Tasks, id }, Actor::system())
            .unwrap();
        sf.flush(&world, &event).unwrap();

        let world2 = sf.load_world().unwrap();
        assert!(world2.tasks.is_empty());
        assert_eq!(world2.revision, 2);

        cleanup(&path);
    }
}
