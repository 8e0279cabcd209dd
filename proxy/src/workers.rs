/// Per-port uniquification of upstream credentials.
///
/// Several rigs behind one port often authorize with the same
/// `login.worker`; the pool would treat them as one session. Each port
/// keeps reference counts per base credential and hands every pipeline a
/// 1-based index to suffix its credential with.
use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

#[derive(Default)]
struct RegistryState {
    /// Pipeline -> (claimed base, the index it was handed).
    claim_by_conn: HashMap<Uuid, (String, u32)>,
    count_by_base: HashMap<String, u32>,
}

#[derive(Default)]
pub struct WorkerRegistry {
    state: Mutex<RegistryState>,
}

/// What a release did to the claim's base credential.
pub struct Released {
    pub base: String,
    /// True when this was the last live claim for the base.
    pub now_zero: bool,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `base` for a pipeline and return its uniquification index.
    /// Re-claiming with a different base releases the previous one first;
    /// re-claiming the same base keeps the index stable.
    pub fn claim(&self, conn: Uuid, base: &str) -> u32 {
        let mut state = self.state.lock().unwrap();
        if let Some((prev, k)) = state.claim_by_conn.get(&conn).cloned() {
            if prev == base {
                return k;
            }
            decrement(&mut state.count_by_base, &prev);
        }
        let count = state.count_by_base.entry(base.to_string()).or_insert(0);
        *count += 1;
        let k = *count;
        state.claim_by_conn.insert(conn, (base.to_string(), k));
        k
    }

    /// Drop a pipeline's claim when it terminates.
    pub fn release(&self, conn: Uuid) -> Option<Released> {
        let mut state = self.state.lock().unwrap();
        let (base, _) = state.claim_by_conn.remove(&conn)?;
        let now_zero = decrement(&mut state.count_by_base, &base);
        Some(Released { base, now_zero })
    }

    #[cfg(test)]
    pub fn count(&self, base: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.count_by_base.get(base).copied().unwrap_or(0)
    }
}

fn decrement(counts: &mut HashMap<String, u32>, base: &str) -> bool {
    match counts.get_mut(base) {
        Some(count) if *count > 1 => {
            *count -= 1;
            false
        }
        Some(_) => {
            counts.remove(base);
            true
        }
        None => true,
    }
}
