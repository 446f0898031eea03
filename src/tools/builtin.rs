use rand::Rng;
use serde::Serialize;

use super::{NoArgs, ToolRegistry};
use crate::Result;

#[derive(Debug, Serialize)]
pub struct CurrentTime {
    pub current_time: String,
}

#[derive(Debug, Serialize)]
pub struct RandomNumber {
    pub random_number: u32,
}

/// # Errors
/// Never fails; the signature matches the registry's handler shape.
#[allow(clippy::unused_async)]
pub async fn get_current_time(_: NoArgs) -> Result<CurrentTime> {
    Ok(CurrentTime {
        current_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
    })
}

/// # Errors
/// Never fails; the signature matches the registry's handler shape.
#[allow(clippy::unused_async)]
pub async fn get_random_number(_: NoArgs) -> Result<RandomNumber> {
    Ok(RandomNumber {
        random_number: rand::thread_rng().gen_range(1..=100),
    })
}

pub fn register(registry: &mut ToolRegistry) {
    registry.tool("get_current_time", "Returns the current time.", get_current_time);
    registry.tool(
        "get_random_number",
        "Returns a random number between 1 and 100.",
        get_random_number,
    );
}
