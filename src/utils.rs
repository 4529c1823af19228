use anyhow::{anyhow, Result};
use std::fmt::Display;
use std::str::FromStr;

pub fn parse_number<T>(value: &str, name: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse::<T>()
        .map_err(|e| anyhow!("couldn't parse {} value {:?}: {}", name, value, e))
}
