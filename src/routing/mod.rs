mod matcher;
mod pattern;

pub use matcher::{Route, RouteEntry, RouteStatus, RouteTable, RouteTarget};
pub use pattern::PathPattern;
