mod location;

pub use location::{validate_all, Coordinates, Location};

#[cfg(test)]
pub use location::sample;
