//! BAR0 controller registers and doorbell layout.

use std::time::Duration;

use bitflags::bitflags;

pub const REG_CAP: u64 = 0x0000;
pub const REG_VS: u64 = 0x0008;
pub const REG_CC: u64 = 0x0014;
pub const REG_CSTS: u64 = 0x001c;
pub const REG_AQA: u64 = 0x0024;
pub const REG_ASQ: u64 = 0x0028;
pub const REG_ACQ: u64 = 0x0030;

/// Offset of the first doorbell (admin SQ tail).
pub const DOORBELL_BASE: u64 = 0x1000;

/// Device page size. MPS is always programmed to 0 (4 KiB).
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Vendor id of QEMU's emulated NVMe controller.
pub const QEMU_VENDOR_ID: u16 = 0x1b36;

bitflags! {
    /// Controller Configuration bits the driver toggles directly.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerConfig: u32 {
        const ENABLE = 1 << 0;
    }

    /// Controller Status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ControllerStatus: u32 {
        const READY = 1 << 0;
        const FATAL = 1 << 1;
    }
}

const CC_MPS_SHIFT: u32 = 7;
const CC_IOSQES_SHIFT: u32 = 16;
const CC_IOCQES_SHIFT: u32 = 20;
const CC_LAYOUT_MASK: u32 = (0xf << CC_MPS_SHIFT)
    | (0x7 << 4)
    | (0x7 << 11)
    | (0xf << CC_IOSQES_SHIFT)
    | (0xf << CC_IOCQES_SHIFT);

/// Programs CC with 64-byte SQEs, 16-byte CQEs, the NVM command set, round robin arbitration and
/// 4 KiB pages, keeping the enable bit as-is.
pub fn configure_cc(cc: u32) -> u32 {
    (cc & !CC_LAYOUT_MASK) | (6 << CC_IOSQES_SHIFT) | (4 << CC_IOCQES_SHIFT)
}

/// Decoded Controller Capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities(pub u64);

impl Capabilities {
    /// Maximum queue entries supported, as a real (one-based) count.
    pub fn max_queue_entries(self) -> u32 {
        (self.0 & 0xffff) as u32 + 1
    }

    /// Worst-case time for CSTS.RDY to change after toggling CC.EN.
    pub fn ready_timeout(self) -> Duration {
        let units = (self.0 >> 24) & 0xff;
        // TO is in 500ms units; zero would mean "no time at all", which no device means.
        Duration::from_millis(units.max(1) * 500)
    }

    /// Doorbell stride in bytes.
    pub fn doorbell_stride(self) -> u64 {
        4 << ((self.0 >> 32) & 0xf)
    }

    /// log2 of CAP.MPSMIN in bytes.
    pub fn min_page_shift(self) -> u32 {
        PAGE_SHIFT + ((self.0 >> 48) & 0xf) as u32
    }
}

/// AQA value for admin queues of `entries` slots each.
pub fn admin_queue_attributes(sq_entries: u16, cq_entries: u16) -> u32 {
    (u32::from(cq_entries - 1) << 16) | u32::from(sq_entries - 1)
}

pub fn sq_tail_doorbell(qid: u16, stride: u64) -> u64 {
    DOORBELL_BASE + (2 * u64::from(qid)) * stride
}

pub fn cq_head_doorbell(qid: u16, stride: u64) -> u64 {
    DOORBELL_BASE + (2 * u64::from(qid) + 1) * stride
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capabilities_decode() {
        // MQES=127, TO=20 (10s), DSTRD=1, MPSMIN=0.
        let cap = Capabilities(127 | (20 << 24) | (1 << 32));
        assert_eq!(cap.max_queue_entries(), 128);
        assert_eq!(cap.ready_timeout(), Duration::from_secs(10));
        assert_eq!(cap.doorbell_stride(), 8);
        assert_eq!(cap.min_page_shift(), 12);
        assert_eq!(Capabilities(2 << 48).min_page_shift(), 14);
    }

    #[test]
    fn doorbells_follow_stride() {
        assert_eq!(sq_tail_doorbell(0, 4), 0x1000);
        assert_eq!(cq_head_doorbell(0, 4), 0x1004);
        assert_eq!(sq_tail_doorbell(2, 4), 0x1010);
        assert_eq!(cq_head_doorbell(2, 4), 0x1014);
        assert_eq!(cq_head_doorbell(1, 16), 0x1030);
    }

    #[test]
    fn cc_layout_preserves_enable() {
        let cc = configure_cc(0xffff_ffff);
        assert_eq!(cc & 1, 1);
        assert_eq!((cc >> 16) & 0xf, 6);
        assert_eq!((cc >> 20) & 0xf, 4);
        assert_eq!((cc >> 7) & 0xf, 0);
        assert_eq!(configure_cc(0) & 1, 0);
        assert_eq!(admin_queue_attributes(8, 8), 0x0007_0007);
    }
}
