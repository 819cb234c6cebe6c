//! Mutes and mini-bans.
//!
//! A host can silence a player on the chat channel ("mute") or keep them
//! from logging in again ("mini-ban"), by username, IP address or
//! hardware address, forever or until an instant. The server consults
//! this registry on every chat invocation and every login.
//!
//! Persisted mutes (say, from a lobby database) are read through the
//! [`MuteStore`] trait. The registry only caches them: when a timed mute
//! runs out, it is lifted only if the store agrees the identity is no
//! longer muted.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use tokio::time::Instant;

use crate::names::real_name;

/// How many departed players' hardware addresses are remembered.
pub const RECENT_DEPARTURES: usize = 10;

/// Read access to persisted mutes.
///
/// Every method has a "nothing persisted" default, so an implementation
/// only overrides what its backing store knows about.
pub trait MuteStore: Send + Sync + 'static {
    /// When the persisted username mute ends, if there is one.
    fn username_mute_expiry(&self, _username: &str) -> Option<SystemTime> {
        None
    }

    /// When the persisted hardware-address mute ends, if there is one.
    fn hardware_mute_expiry(&self, _hardware_address: &str) -> Option<SystemTime> {
        None
    }

    /// Whether the store still considers the username muted.
    fn is_username_muted(&self, _username: &str) -> bool {
        false
    }

    /// Whether the store still considers the hardware address muted.
    fn is_hardware_muted(&self, _hardware_address: &str) -> bool {
        false
    }
}

/// A store with nothing in it.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMuteStore;

impl MuteStore for NoMuteStore {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Kind {
    Username,
    Ip,
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum List {
    Muted,
    Banned,
}

type Key = (Kind, String);

#[derive(Default)]
struct State {
    muted: HashMap<Key, Option<Instant>>,
    banned: HashMap<Key, Option<Instant>>,
    hardware_by_name: HashMap<String, String>,
    departed: VecDeque<(String, String)>,
}

impl State {
    fn list(&mut self, list: List) -> &mut HashMap<Key, Option<Instant>> {
        match list {
            List::Muted => &mut self.muted,
            List::Banned => &mut self.banned,
        }
    }
}

/// The per-server moderation registry. Cheap to clone.
#[derive(Clone)]
pub struct Moderation {
    state: Arc<Mutex<State>>,
    store: Arc<dyn MuteStore>,
}

impl Default for Moderation {
    fn default() -> Self {
        Self::new(Arc::new(NoMuteStore))
    }
}

impl Moderation {
    pub fn new(store: Arc<dyn MuteStore>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            store,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -----------------------------------------------------------------------
    // Mutes
    // -----------------------------------------------------------------------

    /// Mutes a username (its real name, so every ` (n)` variant too).
    pub fn mute_username(&self, username: &str, expires: Option<Instant>) {
        self.add(List::Muted, (Kind::Username, real_name(username).to_string()), expires);
    }

    pub fn mute_ip(&self, ip: IpAddr, expires: Option<Instant>) {
        self.add(List::Muted, (Kind::Ip, ip.to_string()), expires);
    }

    pub fn mute_hardware_address(&self, hardware_address: &str, expires: Option<Instant>) {
        self.add(List::Muted, (Kind::Hardware, hardware_address.to_string()), expires);
    }

    pub fn unmute_username(&self, username: &str) {
        self.remove(List::Muted, &(Kind::Username, real_name(username).to_string()));
    }

    pub fn unmute_ip(&self, ip: IpAddr) {
        self.remove(List::Muted, &(Kind::Ip, ip.to_string()));
    }

    pub fn unmute_hardware_address(&self, hardware_address: &str) {
        self.remove(List::Muted, &(Kind::Hardware, hardware_address.to_string()));
    }

    pub fn is_username_muted(&self, username: &str) -> bool {
        self.contains(List::Muted, &(Kind::Username, real_name(username).to_string()))
    }

    pub fn is_ip_muted(&self, ip: IpAddr) -> bool {
        self.contains(List::Muted, &(Kind::Ip, ip.to_string()))
    }

    pub fn is_hardware_address_muted(&self, hardware_address: &str) -> bool {
        self.contains(List::Muted, &(Kind::Hardware, hardware_address.to_string()))
    }

    /// True if the sender of a chat message is muted by any identity.
    pub fn is_sender_muted(&self, name: &str, ip: IpAddr, hardware_address: Option<&str>) -> bool {
        let hardware = hardware_address
            .map(str::to_string)
            .or_else(|| self.hardware_address(name));
        self.is_username_muted(name)
            || self.is_ip_muted(ip)
            || hardware.is_some_and(|h| self.is_hardware_address_muted(&h))
    }

    // -----------------------------------------------------------------------
    // Mini-bans
    // -----------------------------------------------------------------------

    pub fn mini_ban_username(&self, username: &str, expires: Option<Instant>) {
        self.add(List::Banned, (Kind::Username, real_name(username).to_string()), expires);
    }

    pub fn mini_ban_ip(&self, ip: IpAddr, expires: Option<Instant>) {
        self.add(List::Banned, (Kind::Ip, ip.to_string()), expires);
    }

    pub fn mini_ban_hardware_address(&self, hardware_address: &str, expires: Option<Instant>) {
        self.add(List::Banned, (Kind::Hardware, hardware_address.to_string()), expires);
    }

    pub fn is_username_mini_banned(&self, username: &str) -> bool {
        self.contains(List::Banned, &(Kind::Username, real_name(username).to_string()))
    }

    pub fn is_ip_mini_banned(&self, ip: IpAddr) -> bool {
        self.contains(List::Banned, &(Kind::Ip, ip.to_string()))
    }

    pub fn is_hardware_address_mini_banned(&self, hardware_address: &str) -> bool {
        self.contains(List::Banned, &(Kind::Hardware, hardware_address.to_string()))
    }

    /// True if a login from this identity must be turned away.
    pub fn is_login_banned(&self, name: &str, ip: IpAddr, hardware_address: Option<&str>) -> bool {
        self.is_username_mini_banned(name)
            || self.is_ip_mini_banned(ip)
            || hardware_address.is_some_and(|h| self.is_hardware_address_mini_banned(h))
    }

    // -----------------------------------------------------------------------
    // Player tracking
    // -----------------------------------------------------------------------

    /// Remembers a freshly promoted player's hardware address and picks up
    /// any persisted mute that is still in force.
    pub fn record_login(&self, unique_name: &str, hardware_address: Option<&str>) {
        let real = real_name(unique_name);
        let username_until = if self.is_username_muted(real) {
            None
        } else {
            self.store.username_mute_expiry(real).and_then(to_instant)
        };
        let hardware_until = hardware_address.and_then(|h| {
            if self.is_hardware_address_muted(h) {
                None
            } else {
                self.store.hardware_mute_expiry(h).and_then(to_instant)
            }
        });

        if let Some(hardware) = hardware_address {
            self.lock()
                .hardware_by_name
                .insert(unique_name.to_string(), hardware.to_string());
        }
        if let Some(until) = username_until {
            tracing::info!(username = real, "persisted mute still in force");
            self.mute_username(real, Some(until));
        }
        if let (Some(hardware), Some(until)) = (hardware_address, hardware_until) {
            tracing::info!(hardware, "persisted mute still in force");
            self.mute_hardware_address(hardware, Some(until));
        }
    }

    /// Moves a departing player's hardware address into the bounded
    /// recent-departures cache.
    pub fn record_departure(&self, unique_name: &str) {
        let mut state = self.lock();
        let Some(hardware) = state.hardware_by_name.remove(unique_name) else {
            return;
        };
        state.departed.retain(|(name, _)| name != unique_name);
        state.departed.push_back((unique_name.to_string(), hardware));
        while state.departed.len() > RECENT_DEPARTURES {
            state.departed.pop_front();
        }
    }

    /// The hardware address a connected (or recently departed) player
    /// logged in with.
    pub fn hardware_address(&self, unique_name: &str) -> Option<String> {
        let state = self.lock();
        state.hardware_by_name.get(unique_name).cloned().or_else(|| {
            state
                .departed
                .iter()
                .rev()
                .find(|(name, _)| name == unique_name)
                .map(|(_, hardware)| hardware.clone())
        })
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn contains(&self, list: List, key: &Key) -> bool {
        self.lock().list(list).contains_key(key)
    }

    fn remove(&self, list: List, key: &Key) {
        self.lock().list(list).remove(key);
    }

    fn add(&self, list: List, key: Key, expires: Option<Instant>) {
        self.lock().list(list).insert(key.clone(), expires);
        tracing::debug!(?list, kind = ?key.0, value = %key.1, ?expires, "moderation entry added");

        let Some(at) = expires else { return };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(value = %key.1, "no runtime to expire moderation entry; it stays until lifted");
            return;
        };
        let this = self.clone();
        runtime.spawn(async move {
            tokio::time::sleep_until(at).await;
            this.expire(list, key, at);
        });
    }

    /// Drops `key` if it still carries the expiry this timer was armed for.
    fn expire(&self, list: List, key: Key, at: Instant) {
        if list == List::Muted {
            let still_persisted = match key.0 {
                Kind::Username => self.store.is_username_muted(&key.1),
                Kind::Hardware => self.store.is_hardware_muted(&key.1),
                Kind::Ip => false,
            };
            if still_persisted {
                tracing::debug!(value = %key.1, "mute expired locally but is still persisted");
                return;
            }
        }

        let mut state = self.lock();
        let entries = state.list(list);
        if entries.get(&key) == Some(&Some(at)) {
            entries.remove(&key);
            tracing::info!(?list, value = %key.1, "moderation entry expired");
        }
    }
}

fn to_instant(at: SystemTime) -> Option<Instant> {
    at.duration_since(SystemTime::now())
        .ok()
        .map(|remaining| Instant::now() + remaining)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ip() -> IpAddr {
        [192, 168, 1, 20].into()
    }

    #[test]
    fn test_username_mute_covers_suffixed_names() {
        let moderation = Moderation::default();
        moderation.mute_username("bob", None);
        assert!(moderation.is_username_muted("bob (2)"));
        assert!(moderation.is_sender_muted("bob (1)", ip(), None));
        moderation.unmute_username("bob (1)");
        assert!(!moderation.is_username_muted("bob"));
    }

    #[test]
    fn test_sender_muted_by_hardware_of_cached_login() {
        let moderation = Moderation::default();
        moderation.record_login("carol", Some("aa:bb"));
        moderation.mute_hardware_address("aa:bb", None);
        assert!(moderation.is_sender_muted("carol", ip(), None));
        assert!(!moderation.is_sender_muted("dave", ip(), None));
    }

    #[test]
    fn test_login_banned_by_any_identity() {
        let moderation = Moderation::default();
        moderation.mini_ban_ip(ip(), None);
        assert!(moderation.is_login_banned("anyone", ip(), None));
        assert!(!moderation.is_login_banned("anyone", [10, 0, 0, 1].into(), None));

        moderation.mini_ban_hardware_address("ff:ff", None);
        assert!(moderation.is_login_banned("x", [10, 0, 0, 1].into(), Some("ff:ff")));
    }

    #[test]
    fn test_departures_cache_is_bounded() {
        let moderation = Moderation::default();
        for i in 0..15 {
            let name = format!("p{i}");
            moderation.record_login(&name, Some(&format!("hw{i}")));
            moderation.record_departure(&name);
        }
        assert_eq!(moderation.hardware_address("p14").as_deref(), Some("hw14"));
        assert_eq!(moderation.hardware_address("p5").as_deref(), Some("hw5"));
        assert_eq!(moderation.hardware_address("p4"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_mute_expires() {
        let moderation = Moderation::default();
        moderation.mute_username("eve", Some(Instant::now() + Duration::from_secs(60)));
        assert!(moderation.is_username_muted("eve"));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(!moderation.is_username_muted("eve"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_remute_without_expiry_survives_old_timer() {
        let moderation = Moderation::default();
        moderation.mute_username("eve", Some(Instant::now() + Duration::from_secs(5)));
        moderation.mute_username("eve", None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(moderation.is_username_muted("eve"));
    }

    struct AlwaysMuted;

    impl MuteStore for AlwaysMuted {
        fn is_username_muted(&self, _username: &str) -> bool {
            true
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_mute_is_not_lifted_by_timer() {
        let moderation = Moderation::new(Arc::new(AlwaysMuted));
        moderation.mute_username("mallory", Some(Instant::now() + Duration::from_secs(1)));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(moderation.is_username_muted("mallory"));
    }

    /// Persisted mutes: "frank" and "de:ad" for another hour, "ivan" ran
    /// out a minute ago.
    struct Persisted;

    impl MuteStore for Persisted {
        fn username_mute_expiry(&self, username: &str) -> Option<SystemTime> {
            match username {
                "frank" => Some(SystemTime::now() + Duration::from_secs(3600)),
                "ivan" => Some(SystemTime::now() - Duration::from_secs(60)),
                _ => None,
            }
        }

        fn hardware_mute_expiry(&self, hardware_address: &str) -> Option<SystemTime> {
            (hardware_address == "de:ad").then(|| SystemTime::now() + Duration::from_secs(3600))
        }
    }

    #[tokio::test]
    async fn test_login_picks_up_persisted_mutes() {
        let moderation = Moderation::new(Arc::new(Persisted));
        assert!(!moderation.is_username_muted("frank"));

        moderation.record_login("frank (1)", None);
        assert!(moderation.is_username_muted("frank"));
        assert!(moderation.is_sender_muted("frank (1)", ip(), None));

        moderation.record_login("grace", Some("de:ad"));
        assert!(moderation.is_hardware_address_muted("de:ad"));
        assert!(moderation.is_sender_muted("grace", ip(), None));

        moderation.record_login("ivan", Some("be:ef"));
        assert!(!moderation.is_sender_muted("ivan", ip(), None));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_mini_ban_expires() {
        let moderation = Moderation::default();
        moderation.mini_ban_username("trent", Some(Instant::now() + Duration::from_secs(30)));
        assert!(moderation.is_login_banned("trent (1)", ip(), None));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!moderation.is_login_banned("trent", ip(), None));
    }
}
