//! Unit and property tests of the pass library.
