use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_histogram_vec, CounterVec, Gauge, HistogramVec,
};

pub static HTTP_REQUESTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "http_requests_total",
        "Requests by route and status",
        &["route", "status"]
    )
    .unwrap()
});

pub static HTTP_REQUEST_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!("http_request_seconds", "Request latency", &["route"]).unwrap()
});

pub static STREAM_CLIENTS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("plan_stream_clients", "Open plan progress streams").unwrap());

pub static LOADED_DOCUMENTS: Lazy<Gauge> =
    Lazy::new(|| register_gauge!("loaded_documents", "Documents loaded at startup").unwrap());
