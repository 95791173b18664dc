//! Progress meters rendered through `tracing` during an epoch.

use std::fmt;

#[derive(Debug, Clone)]
pub struct AverageMeter {
    name: &'static str,
    precision: usize,
    pub val: f64,
    pub sum: f64,
    pub count: usize,
}

impl AverageMeter {
    pub fn new(name: &'static str, precision: usize) -> Self {
        Self {
            name,
            precision,
            val: 0.0,
            sum: 0.0,
            count: 0,
        }
    }

    pub fn update(&mut self, val: f64, n: usize) {
        self.val = val;
        self.sum += val * n as f64;
        self.count += n;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl fmt::Display for AverageMeter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:.p$} ({:.p$})",
            self.name,
            self.val,
            self.avg(),
            p = self.precision
        )
    }
}

/// The four meters of a training epoch.
#[derive(Debug, Clone)]
pub struct ProgressMeter {
    prefix: String,
    num_batches: usize,
    pub batch_time: AverageMeter,
    pub throughput: AverageMeter,
    pub loss: AverageMeter,
    pub lr: AverageMeter,
}

impl ProgressMeter {
    pub fn new(prefix: impl Into<String>, num_batches: usize) -> Self {
        Self {
            prefix: prefix.into(),
            num_batches,
            batch_time: AverageMeter::new("Time", 3),
            throughput: AverageMeter::new("Tups/s", 1),
            loss: AverageMeter::new("Loss(bits/tuple)", 4),
            lr: AverageMeter::new("LR", 6),
        }
    }

    pub fn display(&self, batch: usize) -> String {
        let width = self.num_batches.to_string().len();
        format!(
            "{}[{:>w$}/{}] {}  {}  {}  {}",
            self.prefix,
            batch,
            self.num_batches,
            self.batch_time,
            self.throughput,
            self.loss,
            self.lr,
            w = width
        )
    }
}

/// Compact human-readable count, e.g. `1.5K`, `3.2M`.
pub fn human_format(num: f64) -> String {
    let mut value = num;
    let mut magnitude = 0;
    while value.abs() >= 1000.0 && magnitude < 4 {
        magnitude += 1;
        value /= 1000.0;
    }
    let suffix = ["", "K", "M", "B", "T"][magnitude];
    let rendered = format!("{value:.2}");
    let rendered = rendered.trim_end_matches('0').trim_end_matches('.');
    format!("{rendered}{suffix}")
}
