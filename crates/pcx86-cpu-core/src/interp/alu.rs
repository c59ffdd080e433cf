use crate::state::RFlags;

fn mask_for_size(size: usize) -> u64 {
    (1u64 << (size * 8) as u32) - 1
}

fn sign_bit(size: usize) -> u64 {
    1u64 << ((size * 8) as u32 - 1)
}

fn parity(byte: u8) -> bool {
    byte.count_ones() % 2 == 0
}

fn set_result_flags(rflags: &mut RFlags, result: u64, size: usize) {
    rflags.set(RFlags::ZF, result == 0);
    rflags.set(RFlags::SF, (result & sign_bit(size)) != 0);
    rflags.set(RFlags::PF, parity(result as u8));
}

pub fn sub_with_flags(rflags: &mut RFlags, dest: u32, src: u32, size: usize) -> u32 {
    let mask = mask_for_size(size);
    let dest = u64::from(dest) & mask;
    let src = u64::from(src) & mask;
    let result = dest.wrapping_sub(src) & mask;

    let sb = sign_bit(size);
    rflags.set(RFlags::CF, dest < src);
    rflags.set(RFlags::OF, ((dest ^ src) & (dest ^ result) & sb) != 0);
    rflags.set(RFlags::AF, ((dest ^ src ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);

    result as u32
}

/// Flags for `CMP`-style operations (`dest - src`, result discarded).
pub fn update_sub_flags(rflags: &mut RFlags, dest: u32, src: u32, size: usize) {
    let _ = sub_with_flags(rflags, dest, src, size);
}

/// `INC`/`DEC`: like `ADD`/`SUB` by one, but `CF` is preserved.
pub fn inc_dec_with_flags(rflags: &mut RFlags, value: u32, decrement: bool, size: usize) -> u32 {
    let mask = mask_for_size(size);
    let value = u64::from(value) & mask;
    let result = if decrement {
        value.wrapping_sub(1) & mask
    } else {
        value.wrapping_add(1) & mask
    };

    let sb = sign_bit(size);
    let overflow = if decrement {
        value == sb
    } else {
        value == sb - 1
    };
    rflags.set(RFlags::OF, overflow);
    rflags.set(RFlags::AF, ((value ^ 1 ^ result) & 0x10) != 0);
    set_result_flags(rflags, result, size);

    result as u32
}
