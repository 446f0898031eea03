pub mod audio;
pub mod common;
pub mod items;
pub mod session;
pub mod tools;

pub use audio::{AudioFormat, TurnDetection};
pub use common::{ArbitraryJson, DEFAULT_MODEL, ItemStatus, JsonSchema, Modality, Role, Voice};
pub use items::{ContentPart, Item, Response, ResponseStatus};
pub use session::SessionUpdate;
pub use tools::{Tool, ToolChoice, ToolChoiceMode};
