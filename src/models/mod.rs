//! Durable entities and the explicit SQL that maintains them.
//!
//! Every table carries an org id and every query filters by it. Mutations
//! performed by commit hooks are bulk statements over `UNNEST` arrays, one
//! round trip per hook per sprint.

pub mod campaigns;
pub mod channels;
pub mod contacts;
pub mod fields;
pub mod flows;
pub mod groups;
pub mod http_logs;
pub mod imports;
pub mod msgs;
pub mod orgs;
pub mod sessions;
pub mod starts;
pub mod tickets;
pub mod topups;
pub mod urns;

pub use campaigns::{Campaign, CampaignEvent, EventFire, OffsetUnit};
pub use channels::{Channel, ChannelConnection, ChannelEvent, ConnectionStatus};
pub use contacts::{Contact, ContactStatus};
pub use fields::Field;
pub use flows::{Flow, FlowType};
pub use groups::{Group, GroupStatus};
pub use http_logs::HttpLog;
pub use imports::{ContactImport, ContactImportBatch};
pub use msgs::{Label, Msg, MsgDirection};
pub use orgs::Org;
pub use sessions::{FlowRun, Session, SessionStatus};
pub use starts::{FlowStart, FlowStartBatch, StartStatus};
pub use tickets::{Ticket, TicketEvent, Ticketer};

pub type OrgId = i32;
pub type ContactId = i64;
pub type FlowId = i32;
pub type GroupId = i32;
pub type FieldId = i32;
pub type ChannelId = i32;
pub type SessionId = i64;
pub type RunId = i64;
pub type MsgId = i64;
pub type LabelId = i32;
pub type TicketId = i64;
pub type TicketerId = i32;
pub type CampaignId = i32;
pub type CampaignEventId = i32;
pub type EventFireId = i64;
pub type StartId = i64;
pub type ConnectionId = i64;
pub type ImportId = i64;
pub type ImportBatchId = i64;
pub type UserId = i32;
pub type TopupId = i32;
