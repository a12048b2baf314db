use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram, register_histogram_vec, CounterVec, Histogram,
    HistogramVec,
};

pub static SEARCH_MODE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("search_mode_total", "Searches by selected mode", &["mode"]).unwrap()
});

pub static SEARCH_FALLBACK_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "search_fallback_total",
        "Index fallbacks by kind",
        &["kind"]
    )
    .unwrap()
});

pub static HOP_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!("hop_total", "Hops by outcome", &["outcome"]).unwrap()
});

pub static PLAN_STEP_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "plan_step_seconds",
        "Plan step latency",
        &["action"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    )
    .unwrap()
});

pub static ITERATIONS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!(
        "iteration_rounds",
        "Analysis rounds per answered request",
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 8.0]
    )
    .unwrap()
});
