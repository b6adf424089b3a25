/// Run `f` on a path the optimiser should treat as unlikely (pool growth,
/// lock contention, violation reports).
#[cold]
#[inline(never)]
pub fn cold<R, F: FnOnce() -> R>(f: F) -> R {
    f()
}
