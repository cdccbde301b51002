use std::time::{Duration, Instant};

use crate::backend::{Op, OP_COUNT};

pub struct Record {
    pub op: Op,
    pub call_count: usize,
}

pub struct Report {
    pub records: Vec<Record>,
    pub exec_time: Duration,
}

/// Per-opcode execution counters of one thread.
pub struct VmProfiler {
    start_time: Instant,
    counters: [usize; OP_COUNT],
}

impl Default for VmProfiler {
    fn default() -> Self {
        Self {
            counters: [0; OP_COUNT],
            start_time: Instant::now(),
        }
    }
}

impl VmProfiler {
    pub fn enter(&mut self) {
        self.start_time = Instant::now();
    }

    pub fn record_instruction(&mut self, op: Op) {
        self.counters[u16::from(op) as usize] += 1;
    }

    pub fn report(&self) -> Report {
        let exec_time = Instant::now().duration_since(self.start_time);
        let mut records = self
            .counters
            .iter()
            .enumerate()
            .filter(|(_, count)| **count > 0)
            .map(|(i, count)| Record {
                op: Op::from(i as u16),
                call_count: *count,
            })
            .collect::<Vec<_>>();

        records.sort_by(|a, b| b.call_count.cmp(&a.call_count));

        Report { records, exec_time }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_orders_by_count() {
        let mut profiler = VmProfiler::default();

        profiler.record_instruction(Op::AddInt);
        profiler.record_instruction(Op::Jump);
        profiler.record_instruction(Op::Jump);

        let report = profiler.report();

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.records[0].op, Op::Jump);
        assert_eq!(report.records[0].call_count, 2);
    }
}
