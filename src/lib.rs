//! # kdthree
//!
//! `kdthree` is an incremental k-d tree for dynamic 3D point clouds. It keeps
//! a mutating point set queryable at all times: points and axis-aligned boxes
//! can be inserted, lazily deleted and restored while box, radius and
//! k-nearest-neighbour searches run against the same tree, and the structure
//! rebalances itself through partial rebuilds on the fly.
//!
//! ## Features
//!
//! - **Interleaved mutation and search**: insertions, lazy point/box deletion
//!   and box restoration mix freely with range and nearest-neighbour queries.
//! - **Voxel downsampling on insert**: each voxel cell keeps only the point
//!   closest to its centre, with deletions that survive box restoration.
//! - **Self-balancing**: subtrees that grow lopsided or garbage-heavy are
//!   rebuilt, small ones inline and large ones on a dedicated background
//!   thread that works without blocking concurrent searches.
//! - **Removal accounting**: points that leave the tree can be drained
//!   through [`KdTree::acquire_removed_points`].
//!
//! ## Example
//!
//! ```
//! use kdthree::{BoundingBox, KdTree, Point};
//!
//! let tree: KdTree = KdTree::new();
//! tree.build(&[
//!     Point::xyz(0.0, 0.0, 0.0),
//!     Point::xyz(1.0, 0.0, 0.0),
//!     Point::xyz(0.0, 1.0, 0.0),
//!     Point::xyz(0.0, 0.0, 1.0),
//!     Point::xyz(1.0, 1.0, 1.0),
//! ]);
//!
//! let near_origin = tree.box_search(&BoundingBox::new([-0.1; 3], [0.5; 3]));
//! assert_eq!(near_origin.len(), 1);
//!
//! let (nearest, _) = tree.knn_search([0.9, 0.9, 0.9], 2, None);
//! assert_eq!(nearest[0].pos(), [1.0, 1.0, 1.0]);
//! ```
//!
//! ## Main Interface
//!
//! The entry point is [`KdTree`], configured through [`TreeConfig`]; points
//! carry an arbitrary payload type via [`Point`].

mod bounds;
mod build;
mod coord;
mod node;
mod oplog;
mod ops;
mod point;
mod query;
mod rebuild;
mod tree;

pub use bounds::BoundingBox;
pub use point::Point;
pub use tree::{KdTree, TreeConfig};
