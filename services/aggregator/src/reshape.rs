use std::sync::Arc;

use schema::parse_payload;
use store::{AccumulationStore, StoreError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReshapeReport {
    pub rows_appended: usize,
    pub rows_skipped: usize,
}

/// Turns tabular payloads into per-metric accumulation records. Purely
/// additive: it never reads accumulations back and never talks to the
/// network.
#[derive(Debug, Clone)]
pub struct Reshaper {
    store: Arc<AccumulationStore>,
}

impl Reshaper {
    pub fn new(store: Arc<AccumulationStore>) -> Self {
        Self { store }
    }

    pub fn reshape(&self, payload: &str) -> Result<ReshapeReport, StoreError> {
        let parsed = parse_payload(payload);
        if parsed.skipped_rows > 0 {
            debug!(rows_skipped = parsed.skipped_rows, "malformed rows dropped");
        }
        let rows_appended = self.store.append_rows(&parsed.rows)?;
        Ok(ReshapeReport {
            rows_appended,
            rows_skipped: parsed.skipped_rows,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{Metric, MetricSample};
    use tempfile::TempDir;

    fn reshaper() -> (TempDir, Arc<AccumulationStore>, Reshaper) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(AccumulationStore::open(dir.path()).unwrap());
        let reshaper = Reshaper::new(Arc::clone(&store));
        (dir, store, reshaper)
    }

    #[test]
    fn single_row_lands_in_all_five_accumulations() {
        let (_dir, store, reshaper) = reshaper();
        let report = reshaper
            .reshape("ID,T,H,W,O,Ph,Hora\n1,20.5,60,18.2,0.3,7.1,12:00")
            .unwrap();
        assert_eq!(
            report,
            ReshapeReport {
                rows_appended: 1,
                rows_skipped: 0
            }
        );

        let expected = [
            (Metric::AirTemperature, "temperaturaAr.csv", "20.5"),
            (Metric::Humidity, "humidade.csv", "60"),
            (Metric::WaterTemperature, "temperaturaAgua.csv", "18.2"),
            (Metric::WaveHeight, "ondulacao.csv", "0.3"),
            (Metric::Ph, "ph.csv", "7.1"),
        ];
        for (metric, file_name, value) in expected {
            let on_disk = std::fs::read_to_string(store.dir().join(file_name)).unwrap();
            assert_eq!(on_disk, format!("ID,Hora,Valor\n1,12:00,{value}\n"), "{metric}");
        }
    }

    #[test]
    fn n_rows_append_n_tuples_in_order_and_drop_malformed() {
        let (_dir, store, reshaper) = reshaper();
        let payload = "ID,T,H,W,O,Ph,Hora\n\
                       a,1,2,3,4,5,10:00\n\
                       short,1,2\n\
                       b,6,7,8,9,10,10:01\n\
                       \n\
                       c,11,12,13,14,15,10:02\n";
        let report = reshaper.reshape(payload).unwrap();
        assert_eq!(report.rows_appended, 3);
        assert_eq!(report.rows_skipped, 2);

        for metric in Metric::ALL {
            let ids: Vec<String> = store
                .samples(metric)
                .unwrap()
                .into_iter()
                .map(|sample| sample.id)
                .collect();
            assert_eq!(ids, vec!["a", "b", "c"], "{metric}");
        }
        assert_eq!(
            store.samples(Metric::WaveHeight).unwrap()[1],
            MetricSample {
                id: "b".into(),
                timestamp: "10:01".into(),
                value: "9".into(),
            }
        );
    }

    #[test]
    fn header_only_payload_changes_nothing() {
        let (_dir, store, reshaper) = reshaper();
        let report = reshaper.reshape("ID,T,H,W,O,Ph,Hora\n").unwrap();
        assert_eq!(report, ReshapeReport::default());
        assert!(store.all_empty().unwrap());
    }

    #[test]
    fn successive_payloads_accumulate() {
        let (_dir, store, reshaper) = reshaper();
        reshaper.reshape("h\n1,1,1,1,1,1,t1\n").unwrap();
        reshaper.reshape("h\n2,2,2,2,2,2,t2\n").unwrap();
        assert_eq!(
            String::from_utf8(store.contents(Metric::Ph).unwrap()).unwrap(),
            "ID,Hora,Valor\n1,t1,1\n2,t2,2\n"
        );
    }
}
