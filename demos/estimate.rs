//! Estimate the AAV parameters from the command line.
//!
//! Every argument of the form `name=value` replaces the default observation
//! of that parameter, e.g.
//!
//! ```text
//! cargo run --release --example estimate -- incidence=3.1 mortality=0.08
//! ```

use std::str::FromStr;

use aav_nuts::{run_inference, Observations, Parameter};
use anyhow::{Context, Result};

fn main() -> Result<()> {
    let mut observations = Observations::from_values([2.5, 30., 0.1, 0.2, 0.5]);
    for arg in std::env::args().skip(1) {
        let (name, value) = arg
            .split_once('=')
            .with_context(|| format!("Expected name=value, got {arg:?}"))?;
        let parameter = Parameter::from_str(name)?;
        let value: f64 = value
            .parse()
            .with_context(|| format!("Invalid value for {parameter}: {value:?}"))?;
        observations = observations.with(parameter, value);
    }

    let summary = run_inference(&observations)?;
    println!("{summary}");
    Ok(())
}
