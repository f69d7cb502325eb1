use crate::utils::{PAGE_SIZE_2M, PAGE_SIZE_4K, PAGE_SIZE_64K};
use std::sync::OnceLock;

/// Hardware generations known to the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HwFamily {
    Gen9,
    Gen12Lp,
    XeHpc,
}

/// Static per-generation capabilities.
///
/// One immutable entry per `HwFamily`, built once and shared by every device
/// of that generation.
#[derive(Debug)]
pub struct HwInfo {
    pub family: HwFamily,
    pub name: &'static str,
    /// Supported GPU page sizes, ascending.
    pub page_sizes: &'static [u64],
    pub max_group_size: u32,
    pub max_group_size_per_dim: [u32; 3],
    pub kernel_timestamp_valid_bits: u32,
    pub timer_frequency_hz: u64,
    pub compute_engines: u32,
    pub copy_engines: u32,
    /// Opcode of the compute walker command for this generation.
    pub walker_opcode: u16,
    /// Widest fill pattern the compute engine encodes in one command.
    pub max_fill_pattern_size: u32,
}

impl HwInfo {
    /// Largest supported page size `p` with `p <= size`, or the smallest page size.
    #[must_use]
    pub fn page_size_for(&self, size: u64) -> u64 {
        self.page_sizes
            .iter()
            .rev()
            .copied()
            .find(|&p| p <= size)
            .unwrap_or(self.page_sizes[0])
    }

    /// Largest supported page size that evenly divides `size`.
    #[must_use]
    pub fn page_size_dividing(&self, size: u64) -> Option<u64> {
        self.page_sizes
            .iter()
            .rev()
            .copied()
            .find(|&p| p <= size && size % p == 0)
    }

    #[must_use]
    pub fn min_page_size(&self) -> u64 {
        self.page_sizes[0]
    }

    #[must_use]
    pub const fn kernel_timestamp_mask(&self) -> u64 {
        if self.kernel_timestamp_valid_bits >= 64 {
            u64::MAX
        } else {
            (1u64 << self.kernel_timestamp_valid_bits) - 1
        }
    }
}

const GPGPU_WALKER: u16 = 0x7105;
const COMPUTE_WALKER: u16 = 0x7202;

fn build_table() -> [HwInfo; 3] {
    [
        HwInfo {
            family: HwFamily::Gen9,
            name: "Gen9",
            page_sizes: &[PAGE_SIZE_4K, PAGE_SIZE_64K],
            max_group_size: 256,
            max_group_size_per_dim: [256, 256, 256],
            kernel_timestamp_valid_bits: 32,
            timer_frequency_hz: 12_000_000,
            compute_engines: 1,
            copy_engines: 0,
            walker_opcode: GPGPU_WALKER,
            max_fill_pattern_size: 128,
        },
        HwInfo {
            family: HwFamily::Gen12Lp,
            name: "Gen12LP",
            page_sizes: &[PAGE_SIZE_4K, PAGE_SIZE_64K, PAGE_SIZE_2M],
            max_group_size: 512,
            max_group_size_per_dim: [512, 512, 512],
            kernel_timestamp_valid_bits: 32,
            timer_frequency_hz: 19_200_000,
            compute_engines: 1,
            copy_engines: 1,
            walker_opcode: COMPUTE_WALKER,
            max_fill_pattern_size: 128,
        },
        HwInfo {
            family: HwFamily::XeHpc,
            name: "XeHPC",
            page_sizes: &[PAGE_SIZE_2M],
            max_group_size: 1024,
            max_group_size_per_dim: [1024, 1024, 1024],
            kernel_timestamp_valid_bits: 64,
            timer_frequency_hz: 38_400_000,
            compute_engines: 4,
            copy_engines: 2,
            walker_opcode: COMPUTE_WALKER,
            max_fill_pattern_size: 128,
        },
    ]
}

static HW_INFO_TABLE: OnceLock<[HwInfo; 3]> = OnceLock::new();

/// Looks up the immutable capability entry for `family`.
pub fn hw_info(family: HwFamily) -> &'static HwInfo {
    let table = HW_INFO_TABLE.get_or_init(build_table);
    let idx = match family {
        HwFamily::Gen9 => 0,
        HwFamily::Gen12Lp => 1,
        HwFamily::XeHpc => 2,
    };
    &table[idx]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_entries_match_their_family() {
        for family in [HwFamily::Gen9, HwFamily::Gen12Lp, HwFamily::XeHpc] {
            assert_eq!(hw_info(family).family, family);
        }
    }

    #[test]
    fn large_page_only_device_reports_2m() {
        let info = hw_info(HwFamily::XeHpc);
        assert_eq!(info.page_size_for(4096), PAGE_SIZE_2M);
        assert_eq!(info.page_size_dividing(4096), None);
    }

    #[test]
    fn page_size_grows_with_request() {
        let info = hw_info(HwFamily::Gen12Lp);
        assert_eq!(info.page_size_for(4096), PAGE_SIZE_4K);
        assert_eq!(info.page_size_for(PAGE_SIZE_64K * 3), PAGE_SIZE_64K);
        assert_eq!(info.page_size_for(PAGE_SIZE_2M * 2), PAGE_SIZE_2M);
        assert_eq!(info.page_size_dividing(PAGE_SIZE_64K * 3), Some(PAGE_SIZE_64K));
    }

    #[test]
    fn timestamp_mask_respects_valid_bits() {
        assert_eq!(hw_info(HwFamily::Gen12Lp).kernel_timestamp_mask(), 0xFFFF_FFFF);
        assert_eq!(hw_info(HwFamily::XeHpc).kernel_timestamp_mask(), u64::MAX);
    }
}
