use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram, register_int_gauge, CounterVec, Histogram, IntGauge,
};
use std::time::Duration;

lazy_static! {
    // Main loop metrics
    pub static ref LOOP_DURATION_MILLIS: Histogram = register_histogram!(
        "conveyor_loop_duration_millis",
        "the duration of one main loop iteration"
    )
    .unwrap();
    pub static ref LAST_SUCCESSFUL_LOOP_TS: IntGauge = register_int_gauge!(
        "conveyor_last_successful_loop_timestamp_seconds",
        "unix timestamp of the last successful main loop iteration"
    )
    .unwrap();

    // Candidate metrics
    pub static ref CANDIDATES_FILTERED_COUNT: CounterVec = register_counter_vec!(
        "conveyor_candidates_filtered_count",
        "the number of task candidates dropped during filtering",
        &["reason"]
    )
    .unwrap();
    pub static ref SCORING_DURATION_MILLIS: Histogram = register_histogram!(
        "conveyor_scoring_duration_millis",
        "the duration of scoring all candidate groups"
    )
    .unwrap();
    pub static ref QUEUE_LENGTH: IntGauge = register_int_gauge!(
        "conveyor_queue_length",
        "the number of scored candidates in the queue"
    )
    .unwrap();

    // Trigger metrics
    pub static ref TASKS_TRIGGERED_COUNT: CounterVec = register_counter_vec!(
        "conveyor_tasks_triggered_count",
        "the number of tasks triggered on the worker pool",
        &["result"]
    )
    .unwrap();
    pub static ref FREE_BOT_COUNT: IntGauge = register_int_gauge!(
        "conveyor_free_bot_count",
        "the number of free bots seen by the last iteration"
    )
    .unwrap();
}

pub fn observe_loop_duration(duration: Duration) {
    LOOP_DURATION_MILLIS.observe(duration.as_millis() as f64);
}

pub fn set_last_successful_loop(unix_seconds: i64) {
    LAST_SUCCESSFUL_LOOP_TS.set(unix_seconds);
}

pub fn inc_candidates_filtered(reason: &str) {
    CANDIDATES_FILTERED_COUNT
        .with_label_values(&[reason])
        .inc();
}

pub fn observe_scoring_duration(duration: Duration) {
    SCORING_DURATION_MILLIS.observe(duration.as_millis() as f64);
}

pub fn set_queue_length(len: usize) {
    QUEUE_LENGTH.set(len as i64);
}

pub fn inc_tasks_triggered(result: &str) {
    TASKS_TRIGGERED_COUNT.with_label_values(&[result]).inc();
}

pub fn set_free_bot_count(count: usize) {
    FREE_BOT_COUNT.set(count as i64);
}
