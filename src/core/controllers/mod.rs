// One controller implementation per known internal API.
pub mod blis;
pub mod flexiblas;
pub mod mkl;
pub mod openblas;
pub mod openmp;

pub use blis::Blis;
pub use flexiblas::FlexiBlas;
pub use mkl::Mkl;
pub use openblas::OpenBlas;
pub use openmp::OpenMp;
