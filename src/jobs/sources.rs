//! Page sources over the membership tables

use crate::batch::{PageRequest, PageSource};
use crate::db::{Database, Member};
use crate::error::Result;
use crate::membership::{Grade, MemberPayment};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::sync::Arc;

/// Every member, by `member_no`
pub struct AllMembers {
    db: Arc<Database>,
}

impl AllMembers {
    /// Source over the whole `members` table
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PageSource for AllMembers {
    type Record = Member;

    fn name(&self) -> &str {
        "all_members"
    }

    fn sort_key(&self, record: &Member) -> i64 {
        record.member_no
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Member>> {
        self.db.page_members(&request).await
    }
}

/// Members currently holding one grade
pub struct MembersByGrade {
    db: Arc<Database>,
    grade: Grade,
}

impl MembersByGrade {
    /// Source over the holders of `grade`
    pub fn new(db: Arc<Database>, grade: Grade) -> Self {
        Self { db, grade }
    }
}

#[async_trait]
impl PageSource for MembersByGrade {
    type Record = Member;

    fn name(&self) -> &str {
        "members_by_grade"
    }

    fn sort_key(&self, record: &Member) -> i64 {
        record.member_no
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Member>> {
        self.db
            .page_members_by_grade(self.grade.id(), &request)
            .await
    }
}

/// Members whose birthday falls on a given day
///
/// Only month and day are compared, so a 29 February birthday matches in leap years only.
pub struct MembersByBirthday {
    db: Arc<Database>,
    month_day: String,
}

impl MembersByBirthday {
    /// Source over members born on the month-day of `date`
    pub fn new(db: Arc<Database>, date: NaiveDate) -> Self {
        Self {
            db,
            month_day: date.format("%m-%d").to_string(),
        }
    }
}

#[async_trait]
impl PageSource for MembersByBirthday {
    type Record = Member;

    fn name(&self) -> &str {
        "members_by_birthday"
    }

    fn sort_key(&self, record: &Member) -> i64 {
        record.member_no
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<Member>> {
        self.db
            .page_members_by_birthday(&self.month_day, &request)
            .await
    }
}

/// Per-member purchase totals for orders placed in `[start, end)`
pub struct PaymentsInWindow {
    db: Arc<Database>,
    start: i64,
    end: i64,
}

impl PaymentsInWindow {
    /// Source over the window, bounds in unix seconds
    pub fn new(db: Arc<Database>, start: i64, end: i64) -> Self {
        Self { db, start, end }
    }
}

#[async_trait]
impl PageSource for PaymentsInWindow {
    type Record = MemberPayment;

    fn name(&self) -> &str {
        "payments_in_window"
    }

    fn sort_key(&self, record: &MemberPayment) -> i64 {
        record.member_no
    }

    async fn fetch_page(&self, request: PageRequest) -> Result<Vec<MemberPayment>> {
        self.db.page_payments(self.start, self.end, &request).await
    }
}
