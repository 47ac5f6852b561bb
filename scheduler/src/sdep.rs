// sdep.rs — Synchronous dependence functions
//
// `SdepData` answers "how many executions of an upstream unit must complete
// before execution n of a downstream unit can start". Every such function is
// eventually periodic: after a warm-up of `init_dst` downstream executions,
// each further `steady_dst` downstream executions need exactly `steady_src`
// more upstream executions. The warm-up plus one period is tabulated; later
// values are extrapolated.
//
// Preconditions: execution profiles come from the same Topology.
// Postconditions: dep(0) = 0; dep is non-decreasing; dep(n + S_d) =
//                 dep(n) + S_s for every n > init_dst.
// Failure modes: a channel whose consumer drains what its producer never
//                refills, or functions of different slope merged together,
//                are Internal errors.
// Side effects: none.

use std::fmt;

use num_integer::Integer;
use serde::Serialize;

use crate::diag::{Result, ScheduleError};
use crate::topology::UnitProfile;

/// Upper bound on downstream periods searched for the start of periodicity.
const MAX_WARMUP_PERIODS: u64 = 1024;

/// Eventually periodic dependence function between two units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SdepData {
    /// Downstream executions before the function becomes periodic.
    init_dst: u64,
    /// Downstream executions per period.
    steady_dst: u64,
    /// Upstream executions per period.
    steady_src: u64,
    /// dep(1) ..= dep(init_dst + steady_dst).
    table: Vec<u64>,
}

impl SdepData {
    /// dep(n) = n.
    pub fn identity() -> Self {
        SdepData {
            init_dst: 0,
            steady_dst: 1,
            steady_src: 1,
            table: vec![1],
        }
    }

    pub fn init_dst(&self) -> u64 {
        self.init_dst
    }

    pub fn steady_dst(&self) -> u64 {
        self.steady_dst
    }

    pub fn steady_src(&self) -> u64 {
        self.steady_src
    }

    /// Upstream executions required before downstream execution `n`
    /// (1-based). Equivalently, upstream executions guaranteed complete once
    /// the downstream unit has executed `n` times.
    pub fn src_for_dst(&self, n: u64) -> u64 {
        if n == 0 {
            return 0;
        }
        let known = self.table.len() as u64;
        if n <= known {
            return self.table[(n - 1) as usize];
        }
        let over = n - self.init_dst;
        let periods = (over - 1) / self.steady_dst;
        let offset = over - periods * self.steady_dst;
        self.table[(self.init_dst + offset - 1) as usize] + periods * self.steady_src
    }

    /// First downstream execution that needs upstream execution `k`.
    /// None if no downstream execution ever does.
    pub fn dst_for_src(&self, k: u64) -> Option<u64> {
        if k == 0 {
            return Some(0);
        }
        if let Some(pos) = self.table.iter().position(|&d| d >= k) {
            return Some(pos as u64 + 1);
        }
        if self.steady_src == 0 {
            return None;
        }
        (1..=self.steady_dst)
            .map(|r| {
                let base = self.table[(self.init_dst + r - 1) as usize];
                let periods = (k - base).div_ceil(self.steady_src);
                self.init_dst + r + periods * self.steady_dst
            })
            .min()
    }

    /// dep(1) ..= dep(len).
    pub fn prefix(&self, len: u64) -> Vec<u64> {
        (1..=len).map(|n| self.src_for_dst(n)).collect()
    }

    /// Dependence across a single channel.
    ///
    /// `initial` items sit on the channel before either unit runs.
    pub fn for_channel(
        src: &UnitProfile,
        src_port: usize,
        dst: &UnitProfile,
        dst_port: usize,
        initial: u64,
    ) -> Result<SdepData> {
        let produced: u64 = src.steady.iter().map(|e| e.push[src_port]).sum();
        let consumed: u64 = dst.steady.iter().map(|e| e.pop[dst_port]).sum();
        let src_period = src.steady.len() as u64;
        let dst_period = dst.steady.len() as u64;
        let src_init = src.init.len() as u64;
        let dst_init = dst.init.len() as u64;

        let (steady_dst, steady_src) = match (consumed, produced) {
            (0, _) => (dst_period, 0),
            (_, 0) => {
                return Err(ScheduleError::internal(
                    "channel consumer drains items its producer never refills",
                ))
            }
            (u, o) => {
                let g = u.gcd(&o);
                ((o / g) * dst_period, (u / g) * src_period)
            }
        };

        let mut walker = ChannelWalker {
            src,
            src_port,
            dst,
            dst_port,
            initial,
            refills: produced > 0,
            src_executions: 0,
            produced: 0,
            dst_executions: 0,
            consumed: 0,
        };
        let mut table = Vec::new();
        for j in 0..=MAX_WARMUP_PERIODS {
            let start = dst_init + j * steady_dst;
            while (table.len() as u64) < start + 2 * steady_dst {
                table.push(walker.next_dep()?);
            }
            let dep = |n: u64| table[(n - 1) as usize];
            let src_settled = steady_src == 0 || dep(start + 1) >= src_init + steady_src;
            let periodic =
                (start + 1..=start + steady_dst).all(|n| dep(n + steady_dst) == dep(n) + steady_src);
            if src_settled && periodic {
                table.truncate((start + steady_dst) as usize);
                return Ok(SdepData {
                    init_dst: start,
                    steady_dst,
                    steady_src,
                    table,
                });
            }
        }
        Err(ScheduleError::internal(
            "channel dependence never settles into a period",
        ))
    }

    /// Dependence along a path: `first` relates a to b, `second` relates b
    /// to c; the result relates a to c.
    pub fn compose(first: &SdepData, second: &SdepData) -> SdepData {
        let r = first.steady_dst / second.steady_src.gcd(&first.steady_dst);
        let q = r * second.steady_src / first.steady_dst;
        let steady_dst = r * second.steady_dst;
        let steady_src = q * first.steady_src;

        let mut init_dst = second.init_dst;
        if second.steady_src > 0 {
            while second.src_for_dst(init_dst + 1) <= first.init_dst {
                init_dst += 1;
            }
        }
        let table = (1..=init_dst + steady_dst)
            .map(|n| first.src_for_dst(second.src_for_dst(n)))
            .collect();
        SdepData {
            init_dst,
            steady_dst,
            steady_src,
            table,
        }
    }

    /// Pointwise maximum of two functions between the same pair of units.
    pub fn merge(a: &SdepData, b: &SdepData) -> Result<SdepData> {
        if a.steady_src * b.steady_dst != b.steady_src * a.steady_dst {
            return Err(ScheduleError::internal(format!(
                "parallel paths disagree on rate: {}/{} vs {}/{}",
                a.steady_src, a.steady_dst, b.steady_src, b.steady_dst
            )));
        }
        let steady_dst = a.steady_dst.lcm(&b.steady_dst);
        let steady_src = steady_dst / a.steady_dst * a.steady_src;
        let init_dst = a.init_dst.max(b.init_dst);
        let table = (1..=init_dst + steady_dst)
            .map(|n| a.src_for_dst(n).max(b.src_for_dst(n)))
            .collect();
        Ok(SdepData {
            init_dst,
            steady_dst,
            steady_src,
            table,
        })
    }
}

impl fmt::Display for SdepData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (warmup, period) = self.table.split_at(self.init_dst as usize);
        let list = |values: &[u64]| {
            values
                .iter()
                .map(u64::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        };
        if !warmup.is_empty() {
            write!(f, "[{}] ", list(warmup))?;
        }
        write!(
            f,
            "[{}] then +{} every {}",
            list(period),
            self.steady_src,
            self.steady_dst
        )
    }
}

/// Walks a channel one downstream execution at a time, tracking how many
/// upstream executions the consumer has needed so far.
struct ChannelWalker<'a> {
    src: &'a UnitProfile,
    src_port: usize,
    dst: &'a UnitProfile,
    dst_port: usize,
    initial: u64,
    refills: bool,
    src_executions: u64,
    produced: u64,
    dst_executions: u64,
    consumed: u64,
}

impl ChannelWalker<'_> {
    fn next_dep(&mut self) -> Result<u64> {
        let exec = self.dst.execution(self.dst_executions);
        let need = self.consumed + exec.peek[self.dst_port];
        let src_warmup = (self.src.init.len() + self.src.steady.len()) as u64;
        while self.initial + self.produced < need {
            if !self.refills && self.src_executions >= src_warmup {
                return Err(ScheduleError::internal(format!(
                    "consumer needs {need} items but its producer stops after {}",
                    self.initial + self.produced
                )));
            }
            self.produced += self.src.execution(self.src_executions).push[self.src_port];
            self.src_executions += 1;
        }
        self.consumed += exec.pop[self.dst_port];
        self.dst_executions += 1;
        Ok(self.src_executions)
    }
}
