use burn::backend::Autodiff;

#[cfg(not(feature = "wgpu"))]
mod backend {
    use super::*;

    pub type TrainBackend = Autodiff<burn::backend::NdArray>;
    pub type Backend = burn::backend::NdArray;
}

#[cfg(feature = "wgpu")]
mod backend {
    use super::*;

    pub type TrainBackend = Autodiff<burn::backend::Wgpu>;
    pub type Backend = burn::backend::Wgpu;
}

pub use backend::*;
