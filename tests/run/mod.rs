//! Run workflow scenarios driven by scripted provider and engine doubles.

mod bdd_steps;
mod scenarios;
mod test_helpers;
