//! Persistence seam shared by the Scylla connector and the in-memory store.
//!
//! Every method that changes more than one record is a single logical unit:
//! the implementation decides how it stays consistent (conditional writes in
//! Scylla, a write gate in memory), callers never sequence the parts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{FeeRequest, FeeTransaction, PaymentMode, PaymentProof, Student, StudentFields, User};

#[async_trait]
pub trait FeeStore: Send + Sync {
    async fn count_users(&self) -> Result<usize>;

    /// Fails with `DuplicateEmail` when the email is taken. A `bootstrap`
    /// insert only succeeds as the very first user, else `Forbidden`.
    async fn insert_user(&self, user: &User, bootstrap: bool) -> Result<()>;

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Fails with `Conflict` when (rollNo, class, session) is taken.
    async fn insert_student(&self, student: &Student) -> Result<()>;

    /// Replaces the editable fields. `NotFound` or `Conflict` on a key clash
    /// with another student.
    async fn update_student(&self, id: Uuid, fields: StudentFields) -> Result<Student>;

    /// Returns false when nothing was deleted.
    async fn delete_student(&self, id: Uuid) -> Result<bool>;

    async fn get_student(&self, id: Uuid) -> Result<Option<Student>>;

    async fn list_students(&self) -> Result<Vec<Student>>;

    async fn find_students_by_roll(&self, roll_no: &str, class_name: &str) -> Result<Vec<Student>>;

    /// Inserts a pending request and raises the student's outstanding flag.
    /// `Conflict` when the student already has a pending request; the flag
    /// alone is not taken as proof of one.
    async fn create_fee_request(&self, request: &FeeRequest) -> Result<()>;

    async fn get_fee_request(&self, id: Uuid) -> Result<Option<FeeRequest>>;

    async fn pending_fee_requests(&self, student_id: Uuid) -> Result<Vec<FeeRequest>>;

    /// Marks the request paid, appends its ledger entry and credits the
    /// student once. `NotFound` for an unknown request, `Conflict` when it
    /// was already paid.
    async fn settle_fee_request(
        &self,
        id: Uuid,
        mode: PaymentMode,
        proof: Option<PaymentProof>,
        at: DateTime<Utc>,
    ) -> Result<FeeTransaction>;

    /// Appends a direct payment and credits the student, re-checking the
    /// balance due, less any pending request, against the stored record.
    /// Returns the updated student.
    async fn record_payment(&self, transaction: &FeeTransaction) -> Result<Student>;

    /// Newest first.
    async fn list_transactions(&self, student_id: Option<Uuid>) -> Result<Vec<FeeTransaction>>;

    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
