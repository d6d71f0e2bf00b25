//! Segment descriptors and the packed attribute format the VMCB expects.

use bitfield::bitfield;

bitfield! {
    /// See `4.7 Legacy Segment Descriptors`.
    pub struct SegmentDescriptor(u64);
    impl Debug;
    pub get_limit_low, _: 15, 0;
    pub get_base_low, _: 39, 16;
    pub get_type, _: 43, 40;
    pub get_system, _: 44, 44;
    pub get_dpl, _: 46, 45;
    pub get_present, _: 47, 47;
    pub get_limit_high, _: 51, 48;
    pub get_avl, _: 52, 52;
    pub get_long_mode, _: 53, 53;
    pub get_default_bit, _: 54, 54;
    pub get_granularity, _: 55, 55;
    pub get_base_high, _: 63, 56;
}

bitfield! {
    /// Segment attributes as stored in the `*_attrib` fields of the VMCB save
    /// area. See `15.5.1 Basic Operation > Segment State in the VMCB`.
    #[derive(Copy, Clone, PartialEq, Eq)]
    pub struct SegmentAttribute(u16);
    impl Debug;
    pub get_type, set_type: 3, 0;
    pub get_system, set_system: 4, 4;
    pub get_dpl, set_dpl: 6, 5;
    pub get_present, set_present: 7, 7;
    pub get_avl, set_avl: 8, 8;
    pub get_long_mode, set_long_mode: 9, 9;
    pub get_default_bit, set_default_bit: 10, 10;
    pub get_granularity, set_granularity: 11, 11;
}

impl From<SegmentDescriptor> for SegmentAttribute {
    fn from(descriptor: SegmentDescriptor) -> Self {
        let mut attribute = SegmentAttribute(0);
        attribute.set_type(descriptor.get_type() as u16);
        attribute.set_system(descriptor.get_system() as u16);
        attribute.set_dpl(descriptor.get_dpl() as u16);
        attribute.set_present(descriptor.get_present() as u16);
        attribute.set_avl(descriptor.get_avl() as u16);
        attribute.set_long_mode(descriptor.get_long_mode() as u16);
        attribute.set_default_bit(descriptor.get_default_bit() as u16);
        attribute.set_granularity(descriptor.get_granularity() as u16);

        attribute
    }
}

/// Returns the packed access rights of the descriptor referenced by
/// `selector`. Selectors that point outside of `gdt` yield `0`.
pub fn segment_access_right(selector: u16, gdt: &[u64]) -> u16 {
    const RPL_MASK: u16 = 3;
    const TI_MASK: u16 = 4;

    let index = ((selector & !(RPL_MASK | TI_MASK)) >> 3) as usize;
    let Some(&descriptor) = gdt.get(index) else {
        return 0;
    };

    SegmentAttribute::from(SegmentDescriptor(descriptor)).0
}

/// Builds a slice over the descriptor table described by `base` and `limit`
/// as returned by `sgdt`.
///
/// # Safety
///
/// `base` and `limit` must describe the live descriptor table of the current
/// processor.
pub unsafe fn descriptor_table<'a>(base: u64, limit: u16) -> &'a [u64] {
    if base == 0 {
        return &[];
    }

    let entries = (limit as usize + 1) / core::mem::size_of::<u64>();
    core::slice::from_raw_parts(base as *const u64, entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GDT: [u64; 7] = [
        0x0000_0000_0000_0000, // null
        0x0000_0000_0000_0000,
        0x0020_9b00_0000_0000, // kernel code, long mode
        0x0040_9300_0000_0000, // kernel data
        0x00cf_fb00_0000_ffff, // user code 32
        0x00cf_f300_0000_ffff, // user data
        0x0020_fb00_0000_0000, // user code, long mode
    ];

    #[test]
    fn test_kernel_code_segment() {
        assert_eq!(segment_access_right(0x10, &GDT), 0x029b);
    }

    #[test]
    fn test_kernel_data_segment() {
        assert_eq!(segment_access_right(0x18, &GDT), 0x0493);
    }

    #[test]
    fn test_rpl_is_ignored() {
        assert_eq!(segment_access_right(0x2b, &GDT), 0x0cf3);
        assert_eq!(segment_access_right(0x33, &GDT), 0x02fb);

        let attribute = SegmentAttribute(segment_access_right(0x2b, &GDT));
        assert_eq!(attribute.get_dpl(), 3);
        assert_eq!(attribute.get_granularity(), 1);
    }

    #[test]
    fn test_null_and_out_of_range_selector() {
        assert_eq!(segment_access_right(0, &GDT), 0);
        assert_eq!(segment_access_right(0x80, &GDT), 0);
    }

    #[test]
    fn test_descriptor_table() {
        let table = unsafe { descriptor_table(GDT.as_ptr() as u64, (GDT.len() * 8 - 1) as u16) };
        assert_eq!(table.len(), GDT.len());
        assert_eq!(table[2], GDT[2]);
    }
}
