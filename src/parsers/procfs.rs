//! Parsers for the host-wide `/proc` files read by the system streams.
//!
//! Pure functions over file contents so they can be tested with string input.

use crate::error::ParseError;

/// Aggregate CPU jiffies from the `cpu` line of `/proc/stat`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub user: u64,
    pub nice: u64,
    pub system: u64,
    pub idle: u64,
    pub iowait: u64,
    pub irq: u64,
    pub softirq: u64,
    pub steal: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.user
            + self.nice
            + self.system
            + self.idle
            + self.iowait
            + self.irq
            + self.softirq
            + self.steal
    }

    /// Field-wise difference, saturating at zero across counter resets
    pub fn delta(&self, earlier: &CpuTimes) -> CpuTimes {
        CpuTimes {
            user: self.user.saturating_sub(earlier.user),
            nice: self.nice.saturating_sub(earlier.nice),
            system: self.system.saturating_sub(earlier.system),
            idle: self.idle.saturating_sub(earlier.idle),
            iowait: self.iowait.saturating_sub(earlier.iowait),
            irq: self.irq.saturating_sub(earlier.irq),
            softirq: self.softirq.saturating_sub(earlier.softirq),
            steal: self.steal.saturating_sub(earlier.steal),
        }
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
pub fn parse_cpu_times(content: &str) -> Result<CpuTimes, ParseError> {
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some("cpu"))
        .ok_or_else(|| ParseError::new("/proc/stat", "missing aggregate cpu line"))?;

    let parts: Vec<&str> = line.split_whitespace().collect();
    let get_val = |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

    Ok(CpuTimes {
        user: get_val(1),
        nice: get_val(2),
        system: get_val(3),
        idle: get_val(4),
        iowait: get_val(5),
        irq: get_val(6),
        softirq: get_val(7),
        steal: get_val(8),
    })
}

/// Values from `/proc/meminfo`, in KB
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub mem_total: u64,
    pub mem_free: u64,
    pub mem_available: u64,
    pub buffers: u64,
    pub cached: u64,
}

/// Parses `/proc/meminfo` content.
pub fn parse_meminfo(content: &str) -> Result<MemInfo, ParseError> {
    let mut info = MemInfo::default();
    let mut saw_total = false;

    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let value: u64 = value.parse().unwrap_or(0);
        match key {
            "MemTotal:" => {
                info.mem_total = value;
                saw_total = true;
            }
            "MemFree:" => info.mem_free = value,
            "MemAvailable:" => info.mem_available = value,
            "Buffers:" => info.buffers = value,
            "Cached:" => info.cached = value,
            _ => {}
        }
    }

    if !saw_total {
        return Err(ParseError::new("/proc/meminfo", "missing MemTotal"));
    }
    Ok(info)
}

/// One row of `/proc/diskstats`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiskStats {
    pub device: String,
    pub reads: u64,
    pub read_sectors: u64,
    pub read_time: u64,
    pub writes: u64,
    pub write_sectors: u64,
    pub write_time: u64,
}

/// Parses `/proc/diskstats` content.
///
/// Format: major minor name reads r_merged r_sectors r_time writes w_merged w_sectors w_time ...
pub fn parse_diskstats(content: &str) -> Vec<DiskStats> {
    let mut disks = Vec::new();

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }

        let get_val =
            |idx: usize| -> u64 { parts.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        disks.push(DiskStats {
            device: parts[2].to_string(),
            reads: get_val(3),
            read_sectors: get_val(5),
            read_time: get_val(6),
            writes: get_val(7),
            write_sectors: get_val(9),
            write_time: get_val(10),
        });
    }

    disks
}

/// Whole disks only: partitions of a listed disk, loop and ram devices are dropped
pub fn whole_disks(disks: &[DiskStats]) -> Vec<&DiskStats> {
    disks
        .iter()
        .filter(|d| !d.device.starts_with("loop") && !d.device.starts_with("ram"))
        .filter(|d| !disks.iter().any(|parent| is_partition_of(&d.device, &parent.device)))
        .collect()
}

/// `sda1` belongs to `sda` and `nvme0n1p2` to `nvme0n1`, but `nvme0n10` and
/// `dm-10` are devices of their own
fn is_partition_of(device: &str, parent: &str) -> bool {
    if device == parent || parent.starts_with("dm-") || parent.starts_with("md") {
        return false;
    }
    let Some(suffix) = device.strip_prefix(parent) else {
        return false;
    };
    let digits = if parent.ends_with(|c: char| c.is_ascii_digit()) {
        match suffix.strip_prefix('p') {
            Some(digits) => digits,
            None => return false,
        }
    } else {
        suffix
    };
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

/// One interface from `/proc/net/dev`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetDevStats {
    pub interface: String,
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_errs: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_errs: u64,
}

/// Parses `/proc/net/dev` content.
///
/// Format:
/// Inter-|   Receive                                                |  Transmit
///  face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
///    lo: 1234567     1234    0    0    0     0          0         0  1234567     1234    0    0    0     0       0          0
pub fn parse_net_dev(content: &str) -> Vec<NetDevStats> {
    let mut devices = Vec::new();

    for line in content.lines() {
        if line.contains('|') || line.trim().is_empty() {
            continue;
        }

        let Some((interface, counters)) = line.split_once(':') else {
            continue;
        };
        let values: Vec<&str> = counters.split_whitespace().collect();
        if values.len() < 16 {
            continue;
        }

        let get_val =
            |idx: usize| -> u64 { values.get(idx).and_then(|s| s.parse().ok()).unwrap_or(0) };

        devices.push(NetDevStats {
            interface: interface.trim().to_string(),
            rx_bytes: get_val(0),
            rx_packets: get_val(1),
            rx_errs: get_val(2),
            tx_bytes: get_val(8),
            tx_packets: get_val(9),
            tx_errs: get_val(10),
        });
    }

    devices
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cpu_times() {
        let content = "cpu  10 1 5 100 4 0 2 0 0 0\ncpu0 5 0 2 50 2 0 1 0 0 0\nctxt 12345\n";
        let times = parse_cpu_times(content).unwrap();
        assert_eq!(times.user, 10);
        assert_eq!(times.system, 5);
        assert_eq!(times.idle, 100);
        assert_eq!(times.iowait, 4);
        assert_eq!(times.total(), 122);
    }

    #[test]
    fn test_parse_cpu_times_missing_aggregate() {
        assert!(parse_cpu_times("cpu0 1 2 3 4\n").is_err());
    }

    #[test]
    fn test_cpu_delta_saturates() {
        let earlier = CpuTimes {
            user: 10,
            idle: 50,
            ..Default::default()
        };
        let later = CpuTimes {
            user: 15,
            idle: 40,
            ..Default::default()
        };
        let delta = later.delta(&earlier);
        assert_eq!(delta.user, 5);
        assert_eq!(delta.idle, 0);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16384000 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\nBuffers:          204800 kB\nCached:          4096000 kB\nSwapCached:            0 kB\n";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.mem_total, 16384000);
        assert_eq!(info.mem_free, 1024000);
        assert_eq!(info.mem_available, 8192000);
        assert_eq!(info.buffers, 204800);
        assert_eq!(info.cached, 4096000);
    }

    #[test]
    fn test_parse_meminfo_requires_total() {
        assert!(parse_meminfo("MemFree: 10 kB\n").is_err());
    }

    #[test]
    fn test_parse_diskstats_and_filter_partitions() {
        let content = "\
   8       0 sda 100 0 800 50 200 0 1600 70 0 120 120 0 0 0 0
   8       1 sda1 90 0 720 45 180 0 1440 60 0 100 100 0 0 0 0
 259       0 nvme0n1 10 0 80 5 20 0 160 7 0 12 12
 259       1 nvme0n1p1 9 0 72 4 18 0 144 6 0 10 10
   7       0 loop0 5 0 10 1 0 0 0 0 0 1 1
   short line
";
        let disks = parse_diskstats(content);
        assert_eq!(disks.len(), 5);

        let whole: Vec<&str> = whole_disks(&disks).iter().map(|d| d.device.as_str()).collect();
        assert_eq!(whole, vec!["sda", "nvme0n1"]);
    }

    #[test]
    fn test_numbered_devices_are_not_partitions() {
        let content = "\
 253       1 dm-1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 253      10 dm-10 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 259       0 nvme0n1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 259       3 nvme0n10 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 259       4 nvme0n10p1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 179       0 mmcblk0 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
 179       1 mmcblk0p1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
   9       1 md1 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
   9      12 md12 10 0 80 5 20 0 160 7 0 12 12 0 0 0 0
";
        let disks = parse_diskstats(content);
        let whole: Vec<&str> = whole_disks(&disks).iter().map(|d| d.device.as_str()).collect();
        assert_eq!(
            whole,
            vec!["dm-1", "dm-10", "nvme0n1", "nvme0n10", "mmcblk0", "md1", "md12"]
        );
    }

    #[test]
    fn test_parse_net_dev() {
        let content = "\
Inter-|   Receive                                                |  Transmit
 face |bytes    packets errs drop fifo frame compressed multicast|bytes    packets errs drop fifo colls carrier compressed
    lo: 1000      10    0    0    0     0          0         0     1000      10    0    0    0     0       0          0
  eth0: 5000      50    1    0    0     0          0         0     7000      70    2    0    0     0       0          0
";
        let devices = parse_net_dev(content);
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[1].interface, "eth0");
        assert_eq!(devices[1].rx_bytes, 5000);
        assert_eq!(devices[1].tx_packets, 70);
        assert_eq!(devices[1].rx_errs, 1);
        assert_eq!(devices[1].tx_errs, 2);
    }
}
