//! Shared test utilities for the root integration suites.
//!
//! Import via `mod common;` from any test file.

#![allow(dead_code)]

use std::sync::{Arc, Once};

use seep::{
    Bytes, Column, ColumnFilter, NotificationType, Observer, ObserverFactories,
    ObserverSpecification, Seep, SharedConfig, Span, Transaction,
};

static INIT_LOGGING: Once = Once::new();

/// Route `tracing` output through the test harness (`RUST_LOG` is ignored)
pub fn init_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

pub fn check() -> Column {
    Column::new("stat", "check")
}

pub fn count() -> Column {
    Column::new("stat", "count")
}

/// Sums every `stats:*` cell of the row into `stat:count` and deletes them
pub fn stat_summer() -> Arc<dyn Observer> {
    Arc::new(
        |tx: &mut Transaction, row: &Bytes, _: &Column| -> anyhow::Result<()> {
            let mut total = tx.get_i64(row.clone(), &count())?.unwrap_or(0);
            for (column, value) in tx.get_row(row.clone(), &ColumnFilter::family("stats"))? {
                let text = value
                    .to_str()
                    .ok_or_else(|| anyhow::anyhow!("{} is not text", column))?;
                total += text.parse::<i64>()?;
                tx.delete(row.clone(), column)?;
            }
            tx.set_i64(row.clone(), count(), total)?;
            Ok(())
        },
    )
}

pub fn summing_config() -> SharedConfig {
    SharedConfig {
        version: 1,
        observers: vec![ObserverSpecification::new(
            "stat-summer",
            &check(),
            NotificationType::Weak,
        )],
        ..SharedConfig::default()
    }
}

pub fn summing_seep() -> Seep {
    init_logging();
    Seep::in_memory(
        summing_config(),
        ObserverFactories::new().with_instance("stat-summer", stat_summer()),
    )
    .unwrap()
}

pub fn add_stat(seep: &Seep, row: &str, qualifier: &str, value: i64) {
    seep.transaction(|tx| {
        tx.set_i64(row, Column::new("stats", qualifier), value)?;
        tx.weakly_notify(row, check())
    })
    .unwrap();
}

pub fn read_i64(seep: &Seep, row: &str, column: &Column) -> Option<i64> {
    let mut tx = seep.begin().unwrap();
    tx.get_i64(row, column).unwrap()
}

pub fn pending(seep: &Seep) -> usize {
    seep.environment()
        .notifications()
        .scan_pending(&Span::all())
        .unwrap()
        .count()
}
