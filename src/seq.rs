//! Wrap-safe grace-period sequence arithmetic.
//!
//! A sequence value keeps a phase in its low `SEQ_CTR_SHIFT` bits
//! (zero = idle, non-zero = a grace period is running) and the count of
//! grace periods in the remaining high bits. All ordering goes through
//! signed differences so the counter may wrap freely.
//!
//! 可回绕的宽限期序列号运算。
//! 序列值的低 `SEQ_CTR_SHIFT` 位保存阶段（0 = 空闲，非 0 = 宽限期进行中），
//! 其余高位保存宽限期计数。所有比较都基于有符号差值，因此计数器可以自由回绕。

pub(crate) const SEQ_CTR_SHIFT: u32 = 2;
pub(crate) const SEQ_STATE_MASK: usize = (1 << SEQ_CTR_SHIFT) - 1;

/// Cookie value that every poll treats as already completed.
/// 所有轮询都视为已完成的 cookie 值。
pub(crate) const COMPLETED_COOKIE: usize = 0x1;

/// First value of the global counter: 300 grace periods short of wrapping,
/// so every domain crosses the wrap point early in its life.
/// 全局计数器的初始值：距离回绕还有 300 个宽限期，使每个域在早期就跨越回绕点。
pub(crate) const INITIAL_GP_SEQ: usize = 0usize.wrapping_sub(300) << SEQ_CTR_SHIFT;

/// `a >= b` under wraparound.
#[inline]
pub(crate) fn cmp_ge(a: usize, b: usize) -> bool {
    (a.wrapping_sub(b) as isize) >= 0
}

/// `a < b` under wraparound.
#[inline]
pub(crate) fn cmp_lt(a: usize, b: usize) -> bool {
    (a.wrapping_sub(b) as isize) < 0
}

#[inline]
pub(crate) fn ctr(s: usize) -> usize {
    s >> SEQ_CTR_SHIFT
}

#[inline]
pub(crate) fn state(s: usize) -> usize {
    s & SEQ_STATE_MASK
}

/// Whether `s` records a grace period in progress.
/// `s` 是否表示一个进行中的宽限期。
#[inline]
pub(crate) fn in_progress(s: usize) -> bool {
    state(s) != 0
}

/// Value after starting a grace period from idle value `s`.
/// 从空闲值 `s` 开始一个宽限期后的值。
#[inline]
pub(crate) fn start(s: usize) -> usize {
    debug_assert!(
        state(s) == 0,
        "BUG: starting a grace period from in-progress sequence {s:#x}"
    );
    s.wrapping_add(1)
}

/// Value after ending the grace period running in `s`.
/// 结束 `s` 中正在运行的宽限期后的值。
#[inline]
pub(crate) fn end(s: usize) -> usize {
    debug_assert!(
        state(s) != 0,
        "BUG: ending a grace period from idle sequence {s:#x}"
    );
    (s | SEQ_STATE_MASK).wrapping_add(1)
}

/// The value the counter must reach before a full grace period has elapsed
/// relative to an observation of `s`.
///
/// If a grace period is in progress when `s` is observed, that one cannot be
/// trusted and the next one must complete instead.
///
/// 相对于观察到的 `s`，计数器必须到达此值才表示经过了一个完整的宽限期。
/// 如果观察时宽限期正在进行，则该宽限期不可信，必须等待下一个完成。
#[inline]
pub(crate) fn snap(s: usize) -> usize {
    s.wrapping_add(2 * SEQ_STATE_MASK + 1) & !SEQ_STATE_MASK
}

/// Whether `cur` has reached the snapshot `s`.
#[inline]
pub(crate) fn done(cur: usize, s: usize) -> bool {
    cmp_ge(cur, s)
}

/// Like [`done`], but treats a `cur` lagging far behind `s` as done too.
///
/// A cookie that sits more than a few grace periods ahead of the counter can
/// only come from a counter wrap, so it is reported as completed.
///
/// 与 [`done`] 类似，但 `cur` 远远落后于 `s` 时也视为完成。
/// 比计数器超前数个宽限期以上的 cookie 只能来自计数器回绕，因此报告为已完成。
#[inline]
pub(crate) fn done_exact(cur: usize, s: usize) -> bool {
    cmp_ge(cur, s) || cmp_lt(cur, s.wrapping_sub(3 * SEQ_STATE_MASK + 1))
}

/// Whether the grace period requested by snapshot `s` has already started.
#[inline]
pub(crate) fn started(cur: usize, s: usize) -> bool {
    cmp_lt(s.wrapping_sub(1) & !SEQ_STATE_MASK, cur)
}

/// Whether moving from `old` to `new` crossed the end of a grace period.
#[inline]
pub(crate) fn completed_gp(old: usize, new: usize) -> bool {
    cmp_lt(old, new & !SEQ_STATE_MASK)
}

/// Whether moving from `old` to `new` crossed the start of a grace period.
#[inline]
pub(crate) fn new_gp(old: usize, new: usize) -> bool {
    cmp_lt(old.wrapping_add(SEQ_STATE_MASK) & !SEQ_STATE_MASK, new)
}

/// Number of grace periods between two idle boundaries.
#[inline]
pub(crate) fn diff(new: usize, old: usize) -> usize {
    ctr(new.wrapping_sub(old))
}

/// Zero-based number of the grace period `s` is in or last completed,
/// counted from the first one a domain runs.
#[inline]
pub(crate) fn gp_num(s: usize) -> usize {
    diff(s, INITIAL_GP_SEQ)
}
