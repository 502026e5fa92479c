pub mod deconv2d;

pub use deconv2d::{deconv2d, Deconv2d, DeconvArguments, DeconvDescriptor};
