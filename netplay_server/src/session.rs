// Shared session state for the TCP channel.
//
// `SessionState` is the data every TCP connection handler reads and writes:
// the host's core settings, the video-plugin settings blob, cached files,
// and the per-port registration table. It lives behind one mutex; a single
// condvar wakes handlers blocked on data that has not been uploaded yet
// (`RECEIVE_FILE`, `RECEIVE_SETTINGS`, `RECEIVE_VIDEO_SETTINGS` are answered
// only once the data exists).
//
// `close()` is called when the TCP server stops. It wakes every blocked
// waiter, and the waits then return `None` so the handlers can exit.

use std::collections::HashMap;

use bytes::Bytes;
use netplay_protocol::{
    CoreSettings, PlayerData, PlayerNumber, RegistrationId, RegistrationTable,
};
use parking_lot::{Condvar, Mutex};
use tracing::debug;

#[derive(Default)]
struct SessionData {
    core_settings: Option<CoreSettings>,
    video_settings: Option<String>,
    files: HashMap<String, Bytes>,
    registrations: RegistrationTable,
    closed: bool,
}

#[derive(Default)]
pub struct SessionState {
    data: Mutex<SessionData>,
    changed: Condvar,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store (or replace) a named file and wake anyone waiting for it.
    pub fn store_file(&self, name: String, data: Bytes) {
        debug!(%name, len = data.len(), "file stored");
        self.data.lock().files.insert(name, data);
        self.changed.notify_all();
    }

    /// Block until `name` has been uploaded. `None` if the session closed
    /// first.
    pub fn wait_for_file(&self, name: &str) -> Option<Bytes> {
        self.wait_until(|data| data.files.get(name).cloned())
    }

    pub fn set_core_settings(&self, settings: CoreSettings) {
        self.data.lock().core_settings = Some(settings);
        self.changed.notify_all();
    }

    pub fn wait_for_core_settings(&self) -> Option<CoreSettings> {
        self.wait_until(|data| data.core_settings)
    }

    pub fn set_video_settings(&self, settings: String) {
        self.data.lock().video_settings = Some(settings);
        self.changed.notify_all();
    }

    pub fn wait_for_video_settings(&self) -> Option<String> {
        self.wait_until(|data| data.video_settings.clone())
    }

    /// Claim `player`'s port for `player_data.registration`. Succeeds if the
    /// port is free or already held by the same registration (a refresh).
    pub fn register(&self, player: PlayerNumber, player_data: PlayerData) -> bool {
        let mut data = self.data.lock();
        let slot = &mut data.registrations[player.index()];
        if slot.is_some_and(|held| held.registration != player_data.registration) {
            return false;
        }
        *slot = Some(player_data);
        true
    }

    /// Free whichever port `registration` holds.
    pub fn unregister(&self, registration: RegistrationId) -> Option<PlayerNumber> {
        let mut data = self.data.lock();
        let index = data
            .registrations
            .iter()
            .position(|slot| slot.is_some_and(|held| held.registration == registration))?;
        data.registrations[index] = None;
        PlayerNumber::ALL.get(index).copied()
    }

    pub fn registrations(&self) -> RegistrationTable {
        self.data.lock().registrations
    }

    pub fn registered_count(&self) -> usize {
        self.data
            .lock()
            .registrations
            .iter()
            .filter(|slot| slot.is_some())
            .count()
    }

    /// Wake every waiter; subsequent and in-progress waits return `None`.
    pub fn close(&self) {
        self.data.lock().closed = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.data.lock().closed
    }

    fn wait_until<T>(&self, mut ready: impl FnMut(&SessionData) -> Option<T>) -> Option<T> {
        let mut data = self.data.lock();
        loop {
            if data.closed {
                return None;
            }
            if let Some(value) = ready(&data) {
                return Some(value);
            }
            self.changed.wait(&mut data);
        }
    }
}
