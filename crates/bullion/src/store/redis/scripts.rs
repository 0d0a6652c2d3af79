//! Lua sources for the queue transitions.

use redis::Script;

const ENQUEUE_LUA: &str = include_str!("lua/enqueue.lua");
const PROMOTE_DELAYED_LUA: &str = include_str!("lua/promote_delayed.lua");
const CLAIM_NEXT_LUA: &str = include_str!("lua/claim_next.lua");
const EXTEND_LOCK_LUA: &str = include_str!("lua/extend_lock.lua");
const COMPLETE_LUA: &str = include_str!("lua/complete.lua");
const FAIL_OR_RETRY_LUA: &str = include_str!("lua/fail_or_retry.lua");
const UPDATE_PROGRESS_LUA: &str = include_str!("lua/update_progress.lua");
const RECOVER_STALLED_LUA: &str = include_str!("lua/recover_stalled.lua");

/// Script result meaning the caller's token does not hold the job lock.
pub(super) const LOCK_MISMATCH: i64 = -1;

/// Compiled transition scripts. `Script` caches the SHA and falls back to
/// `EVAL` when the server has not seen a script yet.
#[derive(Clone)]
pub(super) struct Scripts {
    pub enqueue: Script,
    pub promote_delayed: Script,
    pub claim_next: Script,
    pub extend_lock: Script,
    pub complete: Script,
    pub fail_or_retry: Script,
    pub update_progress: Script,
    pub recover_stalled: Script,
}

impl Scripts {
    pub fn load() -> Self {
        Self {
            enqueue: Script::new(ENQUEUE_LUA),
            promote_delayed: Script::new(PROMOTE_DELAYED_LUA),
            claim_next: Script::new(CLAIM_NEXT_LUA),
            extend_lock: Script::new(EXTEND_LOCK_LUA),
            complete: Script::new(COMPLETE_LUA),
            fail_or_retry: Script::new(FAIL_OR_RETRY_LUA),
            update_progress: Script::new(UPDATE_PROGRESS_LUA),
            recover_stalled: Script::new(RECOVER_STALLED_LUA),
        }
    }
}
