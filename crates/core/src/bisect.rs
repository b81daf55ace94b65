//! Bisection of state-leaking work items.
//!
//! Given the items that ran before a failing item in one process, find the
//! single item whose leaked state makes it fail. Each round runs the first
//! half of the remaining suspects followed by the failing item in a brand-new
//! process (see [`IsolatedRunner`]); running candidates in a shared process
//! would carry the very state under investigation.
//!
//! Assumes a leak, once introduced, persists for every later item. A failure
//! that needs a specific *combination* of two suspects is not found; the
//! final validation run reports that case as inconclusive.

use tracing::info;

use crate::error::BisectError;

/// Result of the failing item in one isolated run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed,
}

/// Runs an ordered list of items in a fresh OS process.
///
/// The last item of every list is the failing item; the verdict is its result.
pub trait IsolatedRunner {
    fn run(&mut self, items: &[String]) -> Result<Verdict, BisectError>;
}

impl<F> IsolatedRunner for F
where
    F: FnMut(&[String]) -> Result<Verdict, BisectError>,
{
    fn run(&mut self, items: &[String]) -> Result<Verdict, BisectError> {
        self(items)
    }
}

/// Terminal state of a bisection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BisectOutcome {
    /// The failing item fails with nothing before it: no leak to find.
    FailsAlone,
    /// The suspect that reproduces the failure when run right before it.
    LeakFound { culprit: String, rounds: u32 },
    /// The search did not reproduce the original failure.
    Inconclusive { rounds: u32 },
}

/// Search state: the ordered suspects and the fixed failing item.
#[derive(Debug, Clone)]
pub struct BisectSession {
    suspects: Vec<String>,
    failing_item: String,
    rounds: u32,
}

impl BisectSession {
    pub fn new(suspects: Vec<String>, failing_item: impl Into<String>) -> Self {
        Self {
            suspects,
            failing_item: failing_item.into(),
            rounds: 0,
        }
    }

    /// Suspects are the items that ran before `failing_item` in `order`.
    pub fn from_run_order(order: &[String], failing_item: &str) -> Result<Self, BisectError> {
        let position = order
            .iter()
            .position(|item| item == failing_item)
            .ok_or_else(|| BisectError::FailingItemNotFound(failing_item.to_string()))?;
        Ok(Self::new(order[..position].to_vec(), failing_item))
    }

    pub fn suspects(&self) -> &[String] {
        &self.suspects
    }

    pub fn failing_item(&self) -> &str {
        &self.failing_item
    }

    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// One suspect left (or none): nothing more to split.
    pub fn is_narrowed(&self) -> bool {
        self.suspects.len() <= 1
    }

    /// Size of the half tested next: `ceil(n / 2)`.
    fn split_point(&self) -> usize {
        self.suspects.len().div_ceil(2)
    }

    /// The half of the suspects tested this round.
    pub fn candidates(&self) -> &[String] {
        &self.suspects[..self.split_point()]
    }

    /// Items for this round's run: candidates, then the failing item.
    pub fn next_run(&self) -> Vec<String> {
        let mut run = self.candidates().to_vec();
        run.push(self.failing_item.clone());
        run
    }

    /// Narrow the suspects using this round's verdict.
    pub fn record(&mut self, verdict: Verdict) {
        let split = self.split_point();
        match verdict {
            Verdict::Failed => self.suspects.truncate(split),
            Verdict::Passed => {
                self.suspects.drain(..split);
            }
        }
        self.rounds += 1;
    }

    fn validation_run(&self) -> Option<Vec<String>> {
        let culprit = self.suspects.first()?;
        Some(vec![culprit.clone(), self.failing_item.clone()])
    }
}

/// Drives a [`BisectSession`] to completion through an [`IsolatedRunner`].
#[derive(Debug)]
pub struct Bisector<R> {
    runner: R,
}

impl<R: IsolatedRunner> Bisector<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn into_runner(self) -> R {
        self.runner
    }

    pub fn run(&mut self, mut session: BisectSession) -> Result<BisectOutcome, BisectError> {
        let failing = session.failing_item().to_string();

        if self.runner.run(std::slice::from_ref(&failing))? == Verdict::Failed {
            info!(item = %failing, "item fails on its own, nothing to bisect");
            return Ok(BisectOutcome::FailsAlone);
        }

        while !session.is_narrowed() {
            let run = session.next_run();
            let verdict = self.runner.run(&run)?;
            info!(
                round = session.rounds() + 1,
                candidates = run.len() - 1,
                suspects = session.suspects().len(),
                verdict = ?verdict,
                "bisection round"
            );
            session.record(verdict);
        }

        let Some(validation) = session.validation_run() else {
            info!(item = %failing, "no suspects left, bisection inconclusive");
            return Ok(BisectOutcome::Inconclusive {
                rounds: session.rounds(),
            });
        };

        let verdict = self.runner.run(&validation)?;
        let rounds = session.rounds() + 1;
        match verdict {
            Verdict::Failed => {
                info!(culprit = %validation[0], item = %failing, rounds, "leaking item found");
                Ok(BisectOutcome::LeakFound {
                    culprit: validation[0].clone(),
                    rounds,
                })
            }
            Verdict::Passed => {
                info!(item = %failing, rounds, "validation did not reproduce, bisection inconclusive");
                Ok(BisectOutcome::Inconclusive { rounds })
            }
        }
    }
}
