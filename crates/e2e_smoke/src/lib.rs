//! End-to-end smoke tests live in `tests/`; there is no library here.
