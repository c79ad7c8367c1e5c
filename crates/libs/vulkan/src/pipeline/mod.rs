mod graphics;
mod layout;
mod shader;

pub use graphics::*;
pub use layout::*;
pub use shader::*;
