//! Platform abstraction: naming, mapping lifecycle, and the embedded
//! cross-process mutex. This is the only layer that touches raw OS
//! primitives (`mmap`, `flock`, `pthread_mutex_t`); everything above it
//! works in terms of `SegmentHeader`/`ShmMapping` and `RawMutex`.
pub mod mapping;
pub mod mutex;
pub mod path;
