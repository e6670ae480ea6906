use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

use crate::config::Settings;
use crate::error::ApiError;
use crate::persist::SaveFile;
use crate::world::{Actor, Command, Event, World};

/// Subscribers further behind than this get a resync instead of events.
pub const BROADCAST_CAPACITY: usize = 256;

pub struct AppState {
    pub world: RwLock<World>,
    pub save_file: SaveFile,
    pub events_tx: broadcast::Sender<Event>,
    pub settings: Settings,
    /// Outbound client for Mattermost.
    pub http: reqwest::Client,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    pub fn new(world: World, save_file: SaveFile, settings: Settings) -> SharedState {
        let (events_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(AppState {
            world: RwLock::new(world),
            save_file,
            events_tx,
            settings,
            http: reqwest::Client::new(),
        })
    }

    pub fn read_world(&self) -> RwLockReadGuard<'_, World> {
        self.world.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn write_world(&self) -> RwLockWriteGuard<'_, World> {
        self.world.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a command, flush the event to the save file and broadcast it.
    /// All synchronous under the write lock, so subscribers see events in
    /// revision order.
    pub fn commit(&self, cmd: Command, actor: Actor) -> Result<Event, ApiError> {
        self.commit_checked(|_| Ok((cmd, ())), actor).map(|(event, ())| event)
    }

    /// Like commit(), but `prepare` inspects the world under the same write
    /// lock and builds the command. Check-then-act sequences (spending a
    /// single-use code) stay atomic.
    pub fn commit_checked<T>(
        &self,
        prepare: impl FnOnce(&World) -> Result<(Command, T), ApiError>,
        actor: Actor,
    ) -> Result<(Event, T), ApiError> {
        let mut world = self.write_world();
        let (cmd, extra) = prepare(&world)?;
        let event = world.apply(cmd, actor)?;
        if let Err(e) = self.save_file.flush(&world, &event) {
            tracing::error!(error = %e, revision = event.revision(), "save file flush failed");
        }
        tracing::debug!(
            action = ?event.action(),
            collection = %event.collection(),
            id = %event.record().id(),
            revision = event.revision(),
            "applied"
        );
        // No receivers is fine
        let _ = self.events_tx.send(event.clone());
        Ok((event, extra))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::test_state;
    use super::*;
    use crate::dto::TaskInput;
    use crate::world::RecordInput;

    #[tokio::test]
    async fn commit_flushes_and_broadcasts() {
        let (state, path) = test_state("commit");
        let mut rx = state.events_tx.subscribe();

        let input = TaskInput { title: Some("Ship".into()), ..Default::default() };
        let event = state
            .commit(Command::Create { input: RecordInput::Task(input) }, Actor::system())
            .unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        let reloaded = state.save_file.load_world().unwrap();
        assert_eq!(reloaded.revision, event.revision());
        assert!(reloaded.tasks.contains_key(&event.record().id()));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn rejected_commands_are_not_broadcast() {
        let (state, path) = test_state("reject");
        let mut rx = state.events_tx.subscribe();
        let err = state.commit(Command::Create { input: RecordInput::Task(TaskInput::default()) }, Actor::system());
        assert!(err.is_err());
        assert!(rx.try_recv().is_err());
        let _ = std::fs::remove_file(path);
    }
}
