//! Integration tests for the SelfStart control plane live in `tests/`.
