pub mod composer;
pub mod model;

pub use composer::ReportComposer;
pub use model::{DocumentModel, Section, TableModel};
