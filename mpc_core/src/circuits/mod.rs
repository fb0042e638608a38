mod elementary;
pub use elementary::{dot_product, power};

mod sequences;
pub use sequences::{fold_tree, product};
