use chrono::Duration;

/// Score floor for try-job candidates; grows with job age.
pub const CANDIDATE_SCORE_TRY_JOB: f64 = 10.0;

/// Score floor for forced candidates; grows with job age.
pub const CANDIDATE_SCORE_FORCE_RUN: f64 = 100.0;

/// How well a contiguous range of `n` commits is tested by a single run:
/// one data point fully tests one commit; each additional commit in the
/// range is only partially attributable.
pub fn testedness(n: i64) -> f64 {
    if n < 0 {
        -1.0
    } else if n == 0 {
        0.0
    } else if n == 1 {
        1.0
    } else {
        1.0 + (n as f64 - 1.0) / n as f64
    }
}

/// The increase in testedness obtained by running a task with a blamelist
/// of `blamelist_length` commits, `stole_from_length` of which were
/// previously attributed to an earlier task (0 when nothing is stolen).
pub fn testedness_increase(blamelist_length: i64, stole_from_length: i64) -> f64 {
    if blamelist_length <= 0 || stole_from_length < 0 {
        return -1.0;
    }
    if stole_from_length == 0 {
        // Previously untested commits count in full on top of the
        // testedness they gain.
        return testedness(blamelist_length) + blamelist_length as f64;
    }
    if blamelist_length == stole_from_length {
        // A pure retry adds no information.
        return 0.0;
    }
    testedness(blamelist_length) + testedness(stole_from_length - blamelist_length)
        - testedness(stole_from_length)
}

/// Multiplier decaying linearly from 1 at age zero to `decay_amt` at 24
/// hours, then on to zero. `decay_amt = 1` disables decay.
pub fn time_decay_24hr(decay_amt: f64, age: Duration) -> f64 {
    let days = (age.num_milliseconds().max(0) as f64) / (24.0 * 60.0 * 60.0 * 1000.0);
    (1.0 - (1.0 - decay_amt) * days).max(0.0)
}

pub fn hours_since(age: Duration) -> f64 {
    (age.num_milliseconds().max(0) as f64) / (60.0 * 60.0 * 1000.0)
}
