//! In-memory collaborators shared by unit tests

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::authority::{AssignmentAuthority, ServiceProvider};
use crate::error::{Error, Result};
use crate::model::{NodeUser, ProviderClaim, RawNodeUser, ReplicaInfo, UNKNOWN_CLOCK};
use crate::peer::{ClockStatus, PeerClient, SyncPayload, UserDirectory, VerboseHealth, WalletClock};

/// Scriptable content-node network
#[derive(Default)]
pub struct FakePeers {
    unreachable: Mutex<HashSet<String>>,
    health: Mutex<HashMap<String, VerboseHealth>>,
    clocks: Mutex<HashMap<(String, String), i64>>,
    sync_targets: Mutex<HashMap<(String, String), i64>>,
    syncs: Mutex<Vec<(String, SyncPayload)>>,
    failing_clock_queries: Mutex<HashSet<String>>,
    pub batch_calls: AtomicUsize,
}

impl FakePeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, endpoint: &str) {
        self.unreachable.lock().unwrap().insert(endpoint.to_string());
    }

    pub fn set_reachable(&self, endpoint: &str) {
        self.unreachable.lock().unwrap().remove(endpoint);
    }

    pub fn set_health(&self, endpoint: &str, health: VerboseHealth) {
        self.health.lock().unwrap().insert(endpoint.to_string(), health);
    }

    pub fn set_clock(&self, endpoint: &str, wallet: &str, clock: i64) {
        self.clocks
            .lock()
            .unwrap()
            .insert((endpoint.to_string(), wallet.to_string()), clock);
    }

    pub fn clock(&self, endpoint: &str, wallet: &str) -> i64 {
        self.clocks
            .lock()
            .unwrap()
            .get(&(endpoint.to_string(), wallet.to_string()))
            .copied()
            .unwrap_or(UNKNOWN_CLOCK)
    }

    /// Single-wallet clock queries against `endpoint` fail
    pub fn fail_clock_queries(&self, endpoint: &str) {
        self.failing_clock_queries.lock().unwrap().insert(endpoint.to_string());
    }

    /// When a sync reaches `secondary` for `wallet`, its clock jumps to `clock`
    pub fn set_sync_target(&self, secondary: &str, wallet: &str, clock: i64) {
        self.sync_targets
            .lock()
            .unwrap()
            .insert((secondary.to_string(), wallet.to_string()), clock);
    }

    pub fn sync_requests(&self) -> Vec<(String, SyncPayload)> {
        self.syncs.lock().unwrap().clone()
    }

    fn check_reachable(&self, endpoint: &str) -> Result<()> {
        if self.unreachable.lock().unwrap().contains(endpoint) {
            Err(Error::peer(endpoint, "connection refused"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerClient for FakePeers {
    async fn verbose_health(&self, endpoint: &str) -> Result<VerboseHealth> {
        self.check_reachable(endpoint)?;
        Ok(self.health.lock().unwrap().get(endpoint).cloned().unwrap_or_default())
    }

    async fn clock_status(&self, endpoint: &str, wallet: &str) -> Result<ClockStatus> {
        self.check_reachable(endpoint)?;
        if self.failing_clock_queries.lock().unwrap().contains(endpoint) {
            return Err(Error::PeerTimeout(endpoint.to_string()));
        }
        Ok(ClockStatus {
            clock_value: self.clock(endpoint, wallet),
            sync_in_progress: false,
        })
    }

    async fn batch_clock_status(&self, endpoint: &str, wallets: &[String]) -> Result<Vec<WalletClock>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable(endpoint)?;
        Ok(wallets
            .iter()
            .map(|w| WalletClock {
                wallet_public_key: w.clone(),
                clock: self.clock(endpoint, w),
            })
            .collect())
    }

    async fn request_sync(&self, secondary: &str, payload: &SyncPayload) -> Result<()> {
        self.check_reachable(secondary)?;
        self.syncs.lock().unwrap().push((secondary.to_string(), payload.clone()));
        for wallet in &payload.wallet {
            let key = (secondary.to_string(), wallet.clone());
            let target = self.sync_targets.lock().unwrap().get(&key).copied();
            if let Some(clock) = target {
                self.clocks.lock().unwrap().insert(key, clock);
            }
        }
        Ok(())
    }
}

/// Records replica-set writes
#[derive(Default)]
pub struct FakeAuthority {
    pub providers: Mutex<Vec<ServiceProvider>>,
    pub updates: Mutex<Vec<(u64, u64, [u64; 2])>>,
    pub fail_writes: AtomicBool,
    pub fail_listing: AtomicBool,
}

impl FakeAuthority {
    pub fn with_providers(providers: &[(&str, u64)]) -> Self {
        let authority = Self::default();
        *authority.providers.lock().unwrap() = providers
            .iter()
            .map(|(endpoint, sp_id)| ServiceProvider {
                endpoint: endpoint.to_string(),
                sp_id: *sp_id,
            })
            .collect();
        authority
    }

    pub fn updates(&self) -> Vec<(u64, u64, [u64; 2])> {
        self.updates.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssignmentAuthority for FakeAuthority {
    async fn update_replica_set(&self, user_id: u64, primary_sp_id: u64, secondary_sp_ids: [u64; 2]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(Error::AuthorityWrite {
                user_id,
                reason: "transaction reverted".into(),
            });
        }
        self.updates
            .lock()
            .unwrap()
            .push((user_id, primary_sp_id, secondary_sp_ids));
        Ok(())
    }

    async fn service_providers(&self) -> Result<Vec<ServiceProvider>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(Error::peer("http://registry", "unreachable"));
        }
        Ok(self.providers.lock().unwrap().clone())
    }
}

/// Discovery node holding a fixed user list
#[derive(Default)]
pub struct FakeUserDirectory {
    pub users: Mutex<Vec<RawNodeUser>>,
    /// Each page takes this long to answer
    pub page_delay: Mutex<Option<Duration>>,
}

#[async_trait]
impl UserDirectory for FakeUserDirectory {
    async fn node_users_page(&self, prev_user_id: u64, max_users: usize) -> Result<Vec<RawNodeUser>> {
        let delay = *self.page_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .users
            .lock()
            .unwrap()
            .iter()
            .filter(|u| u.user_id > prev_user_id)
            .take(max_users)
            .cloned()
            .collect())
    }
}

/// Replica set with provider IDs taken from `ids`
pub fn node_user(user_id: u64, wallet: &str, replicas: [&str; 3], ids: [u64; 3]) -> NodeUser {
    let slot = |endpoint: &str, id: u64| {
        (!endpoint.is_empty()).then(|| ReplicaInfo::new(endpoint, ProviderClaim::Verified(id)))
    };
    NodeUser {
        user_id,
        wallet: wallet.to_string(),
        primary: slot(replicas[0], ids[0]),
        secondary1: slot(replicas[1], ids[1]),
        secondary2: slot(replicas[2], ids[2]),
    }
}

pub fn raw_user(user_id: u64, wallet: &str, replicas: [&str; 3], ids: [u64; 3]) -> RawNodeUser {
    RawNodeUser {
        user_id,
        wallet: wallet.to_string(),
        primary: Some(replicas[0].to_string()),
        secondary1: Some(replicas[1].to_string()),
        secondary2: Some(replicas[2].to_string()),
        primary_sp_id: Some(ids[0]),
        secondary1_sp_id: Some(ids[1]),
        secondary2_sp_id: Some(ids[2]),
    }
}
