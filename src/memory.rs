use async_trait::async_trait;
use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::models::{
    FeeRequest, FeeRequestStatus, FeeTransaction, PaymentMode, PaymentProof, Student, StudentFields, User,
};
use crate::store::FeeStore;

/// In-process store for local runs and tests. Reads go straight to the maps;
/// every write takes the gate so multi-record updates are never interleaved.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    students: DashMap<Uuid, Student>,
    requests: DashMap<Uuid, FeeRequest>,
    transactions: DashMap<Uuid, FeeTransaction>,
    write_gate: Mutex<()>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn student(&self, id: Uuid) -> Option<Student> {
        self.students.get(&id).map(|s| s.value().clone())
    }

    fn pending_amount(&self, student_id: Uuid) -> BigDecimal {
        self.requests
            .iter()
            .filter(|r| r.student_id == student_id && r.status == FeeRequestStatus::Pending)
            .fold(BigDecimal::zero(), |sum, r| sum + &r.amount)
    }
}

#[async_trait]
impl FeeStore for MemoryStore {
    async fn count_users(&self) -> Result<usize> {
        Ok(self.users.len())
    }

    async fn insert_user(&self, user: &User, bootstrap: bool) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        if bootstrap && !self.users.is_empty() {
            return Err(AppError::Forbidden("Only an admin can register new users".to_string()));
        }
        if self.users.iter().any(|u| u.email == user.email) {
            return Err(AppError::DuplicateEmail("User already exists with this email.".to_string()));
        }
        self.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email == email)
            .map(|u| u.value().clone()))
    }

    async fn insert_student(&self, student: &Student) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let key = student.key();
        if self.students.iter().any(|s| s.value().key() == key) {
            return Err(AppError::Conflict(
                "Student with same Roll No already exists in this Class & Session".to_string(),
            ));
        }
        self.students.insert(student.id, student.clone());
        Ok(())
    }

    async fn update_student(&self, id: Uuid, fields: StudentFields) -> Result<Student> {
        let _gate = self.write_gate.lock().await;
        let mut student = self
            .student(id)
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        let key = fields.key();
        if self.students.iter().any(|s| s.id != id && s.value().key() == key) {
            return Err(AppError::Conflict(
                "Another student already exists with same Roll No, Class & Session".to_string(),
            ));
        }
        student.apply_fields(fields)?;
        self.students.insert(id, student.clone());
        Ok(student)
    }

    async fn delete_student(&self, id: Uuid) -> Result<bool> {
        let _gate = self.write_gate.lock().await;
        Ok(self.students.remove(&id).is_some())
    }

    async fn get_student(&self, id: Uuid) -> Result<Option<Student>> {
        Ok(self.student(id))
    }

    async fn list_students(&self) -> Result<Vec<Student>> {
        Ok(self.students.iter().map(|s| s.value().clone()).collect())
    }

    async fn find_students_by_roll(&self, roll_no: &str, class_name: &str) -> Result<Vec<Student>> {
        Ok(self
            .students
            .iter()
            .filter(|s| s.roll_no == roll_no && s.class_name == class_name)
            .map(|s| s.value().clone())
            .collect())
    }

    async fn create_fee_request(&self, request: &FeeRequest) -> Result<()> {
        let _gate = self.write_gate.lock().await;
        let mut student = self
            .student(request.student_id)
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        let outstanding = self
            .requests
            .iter()
            .any(|r| r.student_id == request.student_id && r.status == FeeRequestStatus::Pending);
        if outstanding {
            return Err(AppError::Conflict("Fee request already sent to this student".to_string()));
        }
        student.check_payment(&request.amount)?;
        self.requests.insert(request.id, request.clone());
        student.is_request_sent = true;
        student.updated_at = Utc::now();
        self.students.insert(student.id, student);
        Ok(())
    }

    async fn get_fee_request(&self, id: Uuid) -> Result<Option<FeeRequest>> {
        Ok(self.requests.get(&id).map(|r| r.value().clone()))
    }

    async fn pending_fee_requests(&self, student_id: Uuid) -> Result<Vec<FeeRequest>> {
        let mut pending: Vec<FeeRequest> = self
            .requests
            .iter()
            .filter(|r| r.student_id == student_id && r.status == FeeRequestStatus::Pending)
            .map(|r| r.value().clone())
            .collect();
        pending.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(pending)
    }

    async fn settle_fee_request(
        &self,
        id: Uuid,
        mode: PaymentMode,
        proof: Option<PaymentProof>,
        at: DateTime<Utc>,
    ) -> Result<FeeTransaction> {
        let _gate = self.write_gate.lock().await;
        let mut request = self
            .requests
            .get(&id)
            .map(|r| r.value().clone())
            .ok_or_else(|| AppError::NotFound("Fee request not found".to_string()))?;
        request.settle(mode, proof, at)?;
        let transaction = request.to_transaction()?;

        // A deleted student leaves an orphaned request; it still settles.
        if let Some(mut student) = self.student(request.student_id) {
            student.credit(&request.amount, Some(request.id));
            self.students.insert(student.id, student);
        }
        self.transactions.insert(transaction.id, transaction.clone());
        self.requests.insert(id, request);
        Ok(transaction)
    }

    async fn record_payment(&self, transaction: &FeeTransaction) -> Result<Student> {
        let _gate = self.write_gate.lock().await;
        let mut student = self
            .student(transaction.student_id)
            .ok_or_else(|| AppError::NotFound("Student not found".to_string()))?;
        student.check_direct_payment(&transaction.amount, &self.pending_amount(student.id))?;
        student.credit(&transaction.amount, None);
        self.transactions.insert(transaction.id, transaction.clone());
        self.students.insert(student.id, student.clone());
        Ok(student)
    }

    async fn list_transactions(&self, student_id: Option<Uuid>) -> Result<Vec<FeeTransaction>> {
        let mut transactions: Vec<FeeTransaction> = self
            .transactions
            .iter()
            .filter(|t| student_id.map_or(true, |id| t.student_id == id))
            .map(|t| t.value().clone())
            .collect();
        transactions.sort_by(|a, b| b.date.cmp(&a.date));
        Ok(transactions)
    }
}
