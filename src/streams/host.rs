use log::debug;
use std::sync::Arc;

use crate::collectors::procfs::{ProcSource, DISKSTATS, MEMINFO, NET_DEV, STAT};
use crate::error::SampleError;
use crate::lifecycle::ShutdownSignal;
use crate::parsers::procfs::{
    parse_cpu_times, parse_diskstats, parse_meminfo, parse_net_dev, whole_disks, CpuTimes,
    MemInfo,
};
use crate::samples::{CpuSample, IoSample, MemorySample, NetworkSample, SampleTime};
use crate::scheduler::{FamilyBatch, SamplingStream};
use crate::sink::MetricFamily;

/// Size of a diskstats sector, independent of the device's block size
const SECTOR_SIZE: u64 = 512;

/// Host CPU utilisation
///
/// Percentages cover the time since the previous tick; the first tick
/// reports the average since boot.
pub struct CpuStream {
    proc_fs: Arc<dyn ProcSource>,
    previous: Option<CpuTimes>,
}

impl CpuStream {
    pub const NAME: &'static str = "cpu";

    pub fn new(proc_fs: Arc<dyn ProcSource>) -> Self {
        Self {
            proc_fs,
            previous: None,
        }
    }
}

/// Busy, user, system and iowait shares of `times`, in percent
pub fn cpu_percentages(times: &CpuTimes) -> CpuSample {
    let total = times.total();
    if total == 0 {
        return CpuSample {
            cpu_percent: 0.0,
            user: 0.0,
            system: 0.0,
            iowait: 0.0,
        };
    }
    let pct = |value: u64| value as f64 * 100.0 / total as f64;
    let busy = total.saturating_sub(times.idle + times.iowait);
    CpuSample {
        cpu_percent: pct(busy),
        user: pct(times.user),
        system: pct(times.system),
        iowait: pct(times.iowait),
    }
}

impl SamplingStream for CpuStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Cpu]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        _signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let current = parse_cpu_times(&self.proc_fs.read(STAT)?)?;
        let interval = match &self.previous {
            Some(previous) => current.delta(previous),
            None => current,
        };
        self.previous = Some(current);

        let sample = cpu_percentages(&interval);
        debug!("CPU busy {:.1}%", sample.cpu_percent);
        Ok(vec![FamilyBatch::from_records(
            MetricFamily::Cpu,
            &[sample],
            at,
        )])
    }
}

/// Host memory usage
pub struct MemoryStream {
    proc_fs: Arc<dyn ProcSource>,
}

impl MemoryStream {
    pub const NAME: &'static str = "memory";

    pub fn new(proc_fs: Arc<dyn ProcSource>) -> Self {
        Self { proc_fs }
    }
}

/// Convert meminfo KB values into a byte-valued sample
pub fn memory_sample(info: &MemInfo) -> MemorySample {
    let bytes = |kb: u64| kb.saturating_mul(1024);
    // Kernels before 3.14 do not report MemAvailable
    let available = if info.mem_available > 0 {
        info.mem_available
    } else {
        info.mem_free + info.buffers + info.cached
    };
    let used = info
        .mem_total
        .saturating_sub(info.mem_free)
        .saturating_sub(info.buffers)
        .saturating_sub(info.cached);

    MemorySample {
        total: bytes(info.mem_total),
        available: bytes(available),
        used: bytes(used),
        free: bytes(info.mem_free),
        cached: bytes(info.cached),
        buffers: bytes(info.buffers),
    }
}

impl SamplingStream for MemoryStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Memory]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        _signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let info = parse_meminfo(&self.proc_fs.read(MEMINFO)?)?;
        Ok(vec![FamilyBatch::from_records(
            MetricFamily::Memory,
            &[memory_sample(&info)],
            at,
        )])
    }
}

/// Block device counters summed over whole disks
pub struct IoStream {
    proc_fs: Arc<dyn ProcSource>,
}

impl IoStream {
    pub const NAME: &'static str = "io";

    pub fn new(proc_fs: Arc<dyn ProcSource>) -> Self {
        Self { proc_fs }
    }
}

impl SamplingStream for IoStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Io]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        _signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let disks = parse_diskstats(&self.proc_fs.read(DISKSTATS)?);
        let sample = whole_disks(&disks)
            .into_iter()
            .fold(IoSample::default(), |mut acc, disk| {
                acc.read_bytes += disk.read_sectors * SECTOR_SIZE;
                acc.write_bytes += disk.write_sectors * SECTOR_SIZE;
                acc.read_count += disk.reads;
                acc.write_count += disk.writes;
                acc.read_time_ms += disk.read_time;
                acc.write_time_ms += disk.write_time;
                acc
            });
        Ok(vec![FamilyBatch::from_records(
            MetricFamily::Io,
            &[sample],
            at,
        )])
    }
}

/// Network counters summed over all interfaces
pub struct NetworkStream {
    proc_fs: Arc<dyn ProcSource>,
}

impl NetworkStream {
    pub const NAME: &'static str = "network";

    pub fn new(proc_fs: Arc<dyn ProcSource>) -> Self {
        Self { proc_fs }
    }
}

impl SamplingStream for NetworkStream {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn families(&self) -> &[MetricFamily] {
        &[MetricFamily::Network]
    }

    fn sample(
        &mut self,
        at: &SampleTime,
        _signal: &ShutdownSignal,
    ) -> Result<Vec<FamilyBatch>, SampleError> {
        let interfaces = parse_net_dev(&self.proc_fs.read(NET_DEV)?);
        let sample = interfaces
            .iter()
            .fold(NetworkSample::default(), |mut acc, iface| {
                acc.bytes_sent += iface.tx_bytes;
                acc.bytes_recv += iface.rx_bytes;
                acc.packets_sent += iface.tx_packets;
                acc.packets_recv += iface.rx_packets;
                acc.errin += iface.rx_errs;
                acc.errout += iface.tx_errs;
                acc
            });
        Ok(vec![FamilyBatch::from_records(
            MetricFamily::Network,
            &[sample],
            at,
        )])
    }
}
