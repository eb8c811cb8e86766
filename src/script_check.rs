//! Script verification capability and the driver that applies deadlines and
//! fans input checks out over the rayon pool.

use crate::config::ScriptConfig;
use crate::error::{ConsensusError, Result, ScriptError};
use crate::script::StandardVerifier;
use crate::types::*;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Everything an evaluator needs to decide one input.
#[derive(Debug, Clone, Copy)]
pub struct ScriptCheck<'a> {
    pub unlocking: &'a [u8],
    pub locking: &'a [u8],
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub amount: Amount,
    pub flags: u32,
}

/// Pluggable script evaluator. Implementations should return
/// `ScriptError::Timeout` once `deadline` has passed.
pub trait ScriptVerifier: Send + Sync {
    fn verify(&self, check: &ScriptCheck<'_>, deadline: Instant) -> std::result::Result<bool, ScriptError>;
}

/// An input waiting for script verification, with the output it spends.
#[derive(Debug, Clone)]
pub struct PendingCheck<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub prevout: UtxoEntry,
    pub flags: u32,
}

#[derive(Clone)]
pub struct ScriptChecker {
    verifier: Arc<dyn ScriptVerifier>,
    timeout: Duration,
    parallel: bool,
}

impl std::fmt::Debug for ScriptChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptChecker")
            .field("timeout", &self.timeout)
            .field("parallel", &self.parallel)
            .finish()
    }
}

impl ScriptChecker {
    pub fn new(verifier: Arc<dyn ScriptVerifier>, config: &ScriptConfig) -> Self {
        ScriptChecker {
            verifier,
            timeout: config.timeout(),
            parallel: config.parallel,
        }
    }

    pub fn standard(config: &ScriptConfig) -> Self {
        Self::new(Arc::new(StandardVerifier::new()), config)
    }

    /// Verify one input. Failure, evaluator error and overrunning the
    /// deadline all reject.
    pub fn verify_input(&self, check: &PendingCheck<'_>) -> Result<()> {
        let input = check
            .tx
            .inputs
            .get(check.input_index)
            .ok_or(ConsensusError::Script(ScriptError::InputIndex(check.input_index)))?;
        let script_check = ScriptCheck {
            unlocking: &input.script_sig,
            locking: &check.prevout.script_pubkey,
            tx: check.tx,
            input_index: check.input_index,
            amount: check.prevout.value,
            flags: check.flags,
        };

        let started = Instant::now();
        let verdict = self.verifier.verify(&script_check, started + self.timeout);
        if started.elapsed() > self.timeout {
            return Err(ConsensusError::Script(ScriptError::Timeout));
        }
        match verdict {
            Ok(true) => Ok(()),
            Ok(false) => Err(ConsensusError::ConsensusInvalid(format!(
                "script verification failed for input {}",
                check.input_index
            ))),
            Err(e) => Err(ConsensusError::Script(e)),
        }
    }

    /// Verify a batch. The reported error is the one for the earliest
    /// failing check in `checks` order, whether or not checks ran in parallel.
    pub fn verify_all(&self, checks: &[PendingCheck<'_>]) -> Result<()> {
        let failure = if self.parallel && checks.len() > 1 {
            checks
                .par_iter()
                .find_map_first(|check| self.verify_input(check).err())
        } else {
            checks.iter().find_map(|check| self.verify_input(check).err())
        };
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
