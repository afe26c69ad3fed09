//! The two long-running daemons built on the shared runtime: the
//! necromancer drives bad replicas to Recovering or Lost, the auditor
//! reconciles storage against the catalog location by location.

pub mod auditor;
pub mod necromancer;

pub use auditor::Auditor;
pub use necromancer::Necromancer;
