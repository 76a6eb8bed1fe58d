// Copyright 2025 Irreducible Inc.

/// Division that yields `None` unless `a` is an exact multiple of a non-zero `b`.
pub const fn checked_int_div(a: usize, b: usize) -> Option<usize> {
	if b == 0 || a % b != 0 {
		return None;
	}
	Some(a / b)
}

/// Rounds `value` up to the next multiple of `align`; `align` must be a power of two.
pub const fn align_up(value: usize, align: usize) -> usize {
	(value + align - 1) & !(align - 1)
}
