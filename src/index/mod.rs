pub mod descriptor;
pub mod loading;
pub mod runtime;

pub use descriptor::Descriptor;
pub use loading::LoadingIndex;
pub use runtime::RuntimeIndex;
