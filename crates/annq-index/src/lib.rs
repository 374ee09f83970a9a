//! Index kinds built on top of `annq-distance`: an exact flat store, a
//! sign-bit LSH index, the additive-quantizer family (Residual, Local
//! Search, and Product quantizers), an inverted-file index over either
//! fine representation, and a binary (Hamming) index — all behind the
//! polymorphic `Index` contract in `types`.

pub mod aq;
pub mod binary;
pub mod flat;
pub mod ivf;
pub mod kmeans;
pub mod lsh;
pub mod parallel;
pub mod topk;
pub mod types;

pub use aq::{
    lsq::{LocalSearchQuantizer, LsqConfig},
    product::{ProductAq, ProductAqConfig, SplitKind},
    rq::{ResidualQuantizer, RqConfig},
    AdditiveQuantizer, AqIndex, Codebooks, SearchType,
};
pub use binary::{BinaryIndex, BinaryIndexConfig};
pub use flat::FlatIndex;
pub use ivf::{Ivf, IvfConfig, IvfFlat};
pub use lsh::{LshConfig, LshIndex};
pub use topk::TopK;
pub use types::{Index, IndexConfig, IndexError, RangeSearchResult};
