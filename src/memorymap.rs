//! # Memory Map Module
//!
//! Finds where the traced executable was mapped, which yields the load bias that turns the
//! link-time addresses of its symbols into runtime addresses.
//!
//! The mappings come from `/proc/<pid>/maps`, read with the [`proc_maps`] crate.

use std::path::Path;

use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::addr::Addr;
use crate::errors::Result;

/// One line of a process memory map, reduced to what the load bias needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start_address: Addr,
    pub executable: bool,
    pub path: Option<String>,
}

impl From<&proc_maps::MapRange> for MemoryRegion {
    fn from(range: &proc_maps::MapRange) -> Self {
        MemoryRegion {
            start_address: Addr::from(range.start()),
            executable: range.is_exec(),
            path: range.filename().map(|p| p.to_string_lossy().to_string()),
        }
    }
}

/// Reads the memory map of a process
///
/// # Errors
///
/// Fails if `/proc/<pid>/maps` cannot be read.
pub fn process_regions(pid: Pid) -> Result<Vec<MemoryRegion>> {
    Ok(proc_maps::get_process_maps(pid.into())?
        .iter()
        .map(MemoryRegion::from)
        .collect())
}

/// Lowest start address among the regions that map `exe`
///
/// The first mapping of an image has file offset 0, so for a position independent image this
/// is the bias its symbols are relocated by.
pub fn image_base(regions: &[MemoryRegion], exe: &Path) -> Option<Addr> {
    let exe = exe.to_string_lossy();
    regions
        .iter()
        .filter(|r| r.path.as_deref() == Some(exe.as_ref()))
        .inspect(|r| trace!("{} maps {exe} (x: {})", r.start_address, r.executable))
        .map(|r| r.start_address)
        .min()
}

/// Computes the load bias of the executable `exe` in process `pid`
///
/// Images that are not position independent are linked at their runtime addresses, their bias
/// is 0. For the others a missing mapping also yields 0, with a debug message.
///
/// # Errors
///
/// Fails if the memory map cannot be read.
pub fn load_bias(pid: Pid, exe: &Path, position_independent: bool) -> Result<Addr> {
    if !position_independent {
        return Ok(Addr::NULL);
    }
    let regions = process_regions(pid)?;
    Ok(image_base(&regions, exe).unwrap_or_else(|| {
        debug!("no mapping of {} found, assuming bias 0", exe.display());
        Addr::NULL
    }))
}

#[cfg(test)]
mod test {
    use super::*;

    fn region(start: u64, executable: bool, path: Option<&str>) -> MemoryRegion {
        MemoryRegion {
            start_address: Addr::from(start),
            executable,
            path: path.map(str::to_string),
        }
    }

    #[test]
    fn test_image_base_takes_lowest_matching_region() {
        let regions = vec![
            region(0x7f00_0000_0000, true, Some("/usr/lib/libc.so.6")),
            region(0x5555_5555_5000, true, Some("/tmp/prog")),
            region(0x5555_5555_4000, false, Some("/tmp/prog")),
            region(0x5555_5555_9000, false, None),
        ];
        assert_eq!(
            image_base(&regions, Path::new("/tmp/prog")),
            Some(Addr::from(0x5555_5555_4000u64))
        );
        assert_eq!(image_base(&regions, Path::new("/tmp/prog2")), None);
    }

    #[test]
    fn test_non_pie_has_no_bias() {
        let bias = load_bias(Pid::this(), Path::new("/whatever"), false).unwrap();
        assert!(bias.is_null());
    }

    #[test]
    fn test_own_process_has_a_mapping() {
        let exe = std::fs::read_link("/proc/self/exe").unwrap();
        let regions = process_regions(Pid::this()).unwrap();
        assert!(regions.iter().any(|r| r.executable));
        assert!(image_base(&regions, &exe).is_some());
    }
}
