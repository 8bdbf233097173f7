//! Measurement sink for per-stage timings.
//!
//! A [`Measurement`] collects named parameters and a tree of
//! [`DataPoint`]s over one benchmark run. Datapoints reference OpenCL
//! events (profiling enabled) and plain nanosecond values; aggregation
//! is deferred until the CSV files are written, so recording a
//! datapoint on the hot path costs one `Arc` clone and a push.
//!
//! Three CSV files are emitted per experiment:
//! `<timestamp>_<id>_<base>_expm.csv` (parameters),
//! `..._mnts.csv` (aggregated values) and `..._evnt.csv` (raw event
//! timestamps).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use ocl::enums::ProfilingInfo;
use ocl::{Event, Queue};
use rand::Rng;

use crate::error::Result;

const TIMESTAMP_FORMAT: &str = "%F-%H-%M-%S";

const EXPERIMENT_FILE_SUFFIX: &str = "_expm";
const MEASUREMENTS_FILE_SUFFIX: &str = "_mnts";
const EVENTS_FILE_SUFFIX: &str = "_evnt";

#[derive(Debug, Default)]
struct DataPointInner {
    name: String,
    iteration: Option<u32>,
    // (command queue pointer, event)
    events: Vec<(usize, Event)>,
    values: Vec<u64>,
    children: Vec<DataPoint>,
}

/// A cheaply cloneable handle to one measurement record.
///
/// Handles are passed into scheduler runnables and the cache's I/O
/// worker, which append events and memcpy durations from their own
/// threads.
#[derive(Debug, Clone, Default)]
pub struct DataPoint {
    inner: Arc<Mutex<DataPointInner>>,
}

impl DataPoint {
    fn new(iteration: Option<u32>) -> DataPoint {
        DataPoint {
            inner: Arc::new(Mutex::new(DataPointInner {
                iteration,
                ..Default::default()
            })),
        }
    }

    /// A detached datapoint, useful where a sink is required but the
    /// caller does not keep measurements.
    pub fn detached() -> DataPoint {
        DataPoint::new(None)
    }

    pub fn set_name(&self, name: &str) -> &DataPoint {
        self.inner.lock().unwrap().name = name.to_string();
        self
    }

    /// Attaches a profiled event produced on `queue`.
    pub fn add_event(&self, queue: &Queue, event: Event) {
        let queue_id = queue.as_core().as_ptr() as usize;
        self.inner.lock().unwrap().events.push((queue_id, event));
    }

    /// Attaches a plain nanosecond duration.
    pub fn add_value(&self, nanoseconds: u64) {
        self.inner.lock().unwrap().values.push(nanoseconds);
    }

    pub fn create_child(&self) -> DataPoint {
        let child = DataPoint::new(None);
        self.inner.lock().unwrap().children.push(child.clone());
        child
    }

    /// Sums event durations, values, and children. Waits on any event
    /// that has not completed yet.
    fn aggregate(&self) -> Result<u64> {
        let inner = self.inner.lock().unwrap();
        let mut total = 0u64;
        for (_, event) in &inner.events {
            if event.is_empty() {
                continue;
            }
            event.wait_for()?;
            let start = event.profiling_info(ProfilingInfo::Start)?.time()?;
            let end = event.profiling_info(ProfilingInfo::End)?.time()?;
            total += end.saturating_sub(start);
        }
        for v in &inner.values {
            total += v;
        }
        for child in &inner.children {
            total += child.aggregate()?;
        }
        Ok(total)
    }

    fn name(&self) -> String {
        self.inner.lock().unwrap().name.clone()
    }

    fn iteration(&self) -> Option<u32> {
        self.inner.lock().unwrap().iteration
    }

    fn event_rows(&self, inherited_iteration: Option<u32>) -> Result<Vec<EventRow>> {
        let (events, iteration, name, children) = {
            let inner = self.inner.lock().unwrap();
            (
                inner.events.clone(),
                inner.iteration.or(inherited_iteration),
                inner.name.clone(),
                inner.children.clone(),
            )
        };

        let mut rows = Vec::new();
        for (queue_id, event) in events {
            if event.is_empty() {
                continue;
            }
            event.wait_for()?;
            rows.push(EventRow {
                name: name.clone(),
                iteration,
                queue_id,
                queued: event.profiling_info(ProfilingInfo::Queued)?.time()?,
                submit: event.profiling_info(ProfilingInfo::Submit)?.time()?,
                start: event.profiling_info(ProfilingInfo::Start)?.time()?,
                end: event.profiling_info(ProfilingInfo::End)?.time()?,
            });
        }
        for child in children {
            rows.extend(child.event_rows(iteration)?);
        }
        Ok(rows)
    }
}

struct EventRow {
    name: String,
    iteration: Option<u32>,
    queue_id: usize,
    queued: u64,
    submit: u64,
    start: u64,
    end: u64,
}

/// Measurements of one benchmark run.
#[derive(Debug)]
pub struct Measurement {
    run: u32,
    parameters: BTreeMap<String, String>,
    datapoints: Vec<DataPoint>,
}

impl Measurement {
    pub fn new() -> Measurement {
        let mut m = Measurement {
            run: 0,
            parameters: BTreeMap::new(),
            datapoints: Vec::new(),
        };
        m.set_parameter("TimeStamp", &Utc::now().format(TIMESTAMP_FORMAT).to_string());
        m
    }

    pub fn set_run(&mut self, run: u32) {
        self.run = run;
    }

    pub fn set_parameter(&mut self, name: &str, value: &str) {
        self.parameters.insert(name.to_string(), value.to_string());
    }

    pub fn add_datapoint(&mut self) -> DataPoint {
        let dp = DataPoint::new(None);
        self.datapoints.push(dp.clone());
        dp
    }

    pub fn add_datapoint_for(&mut self, iteration: u32) -> DataPoint {
        let dp = DataPoint::new(Some(iteration));
        self.datapoints.push(dp.clone());
        dp
    }

    /// Writes the three experiment CSV files next to `basefile`,
    /// which contributes its stem to the generated names.
    pub fn write_csv<P: AsRef<Path>>(&self, basefile: P) -> Result<()> {
        let experiment_id = unique_id();
        let timestamp = self
            .parameters
            .get("TimeStamp")
            .cloned()
            .unwrap_or_else(|| Utc::now().format(TIMESTAMP_FORMAT).to_string());

        let basefile = basefile.as_ref();
        let stem = basefile
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "experiment".to_string());
        let dir = basefile.parent().unwrap_or_else(|| Path::new("."));

        let path_for = |suffix: &str| {
            dir.join(format!("{}_{}_{}{}.csv", timestamp, experiment_id, stem, suffix))
        };

        {
            let mut pf = File::create(path_for(EXPERIMENT_FILE_SUFFIX))?;
            writeln!(pf, "ExperimentID,ParameterName,Value")?;
            for (name, value) in &self.parameters {
                writeln!(pf, "{},{},{}", experiment_id, name, value)?;
            }
        }

        {
            let mut mf = File::create(path_for(MEASUREMENTS_FILE_SUFFIX))?;
            writeln!(mf, "ExperimentID,Run,TypeName,Iteration,Value")?;
            for dp in &self.datapoints {
                let iteration = dp
                    .iteration()
                    .map(|i| i.to_string())
                    .unwrap_or_default();
                writeln!(
                    mf,
                    "{},{},{},{},{}",
                    experiment_id,
                    self.run,
                    dp.name(),
                    iteration,
                    dp.aggregate()?
                )?;
            }
        }

        {
            let mut ef = File::create(path_for(EVENTS_FILE_SUFFIX))?;
            writeln!(
                ef,
                "ExperimentID,Run,TypeName,Iteration,CommandQueueID,Queued,Submit,Start,End"
            )?;
            for dp in &self.datapoints {
                for row in dp.event_rows(None)? {
                    let iteration = row
                        .iteration
                        .map(|i| i.to_string())
                        .unwrap_or_default();
                    writeln!(
                        ef,
                        "{},{},{},{},{},{},{},{},{}",
                        experiment_id,
                        self.run,
                        row.name,
                        iteration,
                        row.queue_id,
                        row.queued,
                        row.submit,
                        row.start,
                        row.end
                    )?;
                }
            }
        }

        Ok(())
    }
}

impl Default for Measurement {
    fn default() -> Measurement {
        Measurement::new()
    }
}

fn unique_id() -> String {
    rand::thread_rng().gen_range(0u64..u64::MAX).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_aggregate_through_children() {
        let mut m = Measurement::new();
        let dp = m.add_datapoint();
        dp.set_name("Host");
        dp.add_value(40);
        let child = dp.create_child();
        child.add_value(2);
        assert_eq!(dp.aggregate().unwrap(), 42);
    }

    #[test]
    fn csv_files_are_written() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = Measurement::new();
        m.set_run(3);
        m.set_parameter("NumClusters", "7");
        let dp = m.add_datapoint_for(0);
        dp.set_name("TotalTime");
        dp.add_value(1000);

        m.write_csv(dir.path().join("unit.csv")).unwrap();

        let mut names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        names.sort();
        assert_eq!(names.len(), 3);
        assert!(names.iter().any(|n| n.ends_with("_unit_expm.csv")));
        assert!(names.iter().any(|n| n.ends_with("_unit_mnts.csv")));
        assert!(names.iter().any(|n| n.ends_with("_unit_evnt.csv")));

        let mnts = names.iter().find(|n| n.ends_with("_mnts.csv")).unwrap();
        let body = std::fs::read_to_string(dir.path().join(mnts)).unwrap();
        assert!(body.contains("TotalTime,0,1000"));
    }
}
