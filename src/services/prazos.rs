//! Deadline queries, derived statistics and mutations.
//!
//! Reads go through the session's query cache; every successful write
//! invalidates the user's `prazos:` tag before returning, so the next read
//! observes it.

use chrono::{Datelike, Months, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::db::Database;
use crate::error::{AppError, AppResult, ValidationErrors};
use crate::models::{
    CreatePrazoInput, DueSeries, EstatisticasPrazos, NotificationKind, Period, PrazoFilters, PrazoFiscal,
    PrazoSort, PrazoStatus, UpdatePrazoInput,
};
use crate::services::session::UserSession;
use crate::utils::{format_decimal, month_start, new_id, now_rfc3339, parse_date, period_bounds};

const MAX_DESCRIPTION_LEN: usize = 500;
const DUE_YEARS: std::ops::RangeInclusive<i32> = 1900..=2999;

fn lock_db(db: &Mutex<Database>) -> AppResult<std::sync::MutexGuard<'_, Database>> {
    db.lock().map_err(|_| AppError::Lock("database"))
}

fn cache_key(user_id: &str, filters: &PrazoFilters, sort: PrazoSort, today: NaiveDate) -> String {
    format!("prazos|{}|{:?}|{:?}|{}", user_id, filters, sort, today)
}

pub fn list_prazos(
    db: &Mutex<Database>,
    session: &UserSession,
    filters: &PrazoFilters,
    sort: PrazoSort,
    today: NaiveDate,
) -> AppResult<Vec<PrazoFiscal>> {
    validate_filters(filters)?;
    let key = cache_key(&session.user_id, filters, sort, today);
    let generation = {
        let mut cache = session.cache()?;
        if let Some(hit) = cache.get(&key) {
            tracing::debug!(user = %session.user_id, "prazos cache hit");
            return Ok(hit);
        }
        cache.generation()
    };

    let prazos = load_prazos(db, session, filters, sort, today)?;

    let tag = session.prazos_tag();
    if !session.cache()?.insert_if_current(key, prazos.clone(), &[tag.as_str()], generation) {
        tracing::debug!(user = %session.user_id, "prazos changed during read, result not cached");
    }
    Ok(prazos)
}

fn validate_filters(filters: &PrazoFilters) -> AppResult<()> {
    if let Some(Period::Custom { from, to }) = &filters.period {
        if from > to {
            return Err(AppError::validation(
                "filters.period",
                format!("Custom period starts after it ends ({} > {})", from, to),
            ));
        }
    }
    Ok(())
}

fn load_prazos(
    db: &Mutex<Database>,
    session: &UserSession,
    filters: &PrazoFilters,
    sort: PrazoSort,
    today: NaiveDate,
) -> AppResult<Vec<PrazoFiscal>> {
    let window = filters.period.as_ref().map(|p| period_bounds(p, today));
    let rows = lock_db(db)?.query_prazos(&session.user_id, filters, window, sort)?;

    Ok(rows
        .into_iter()
        .map(|mut prazo| {
            prazo.status = prazo.effective_status(today);
            prazo
        })
        .filter(|prazo| filters.status.map_or(true, |status| prazo.status == status))
        .collect())
}

/// Statistics for exactly the collection `list_prazos` returns for `filters`.
pub fn estatisticas(
    db: &Mutex<Database>,
    session: &UserSession,
    filters: &PrazoFilters,
    today: NaiveDate,
    due_soon_days: i64,
) -> AppResult<EstatisticasPrazos> {
    let prazos = list_prazos(db, session, filters, PrazoSort::default(), today)?;
    Ok(compute_estatisticas(&prazos, today, due_soon_days))
}

pub fn compute_estatisticas(prazos: &[PrazoFiscal], today: NaiveDate, due_soon_days: i64) -> EstatisticasPrazos {
    let horizon = today + chrono::Duration::days(due_soon_days.max(0));
    let mut stats = EstatisticasPrazos::default();
    let mut by_priority = BTreeMap::new();
    let mut by_obligation_type = BTreeMap::new();

    for prazo in prazos {
        let value = prazo.amount.unwrap_or(0.0);
        stats.total += 1;
        stats.total_value += value;

        match prazo.effective_status(today) {
            PrazoStatus::Pending => {
                stats.pending += 1;
                stats.pending_value += value;
                if prazo.due_date <= horizon {
                    stats.due_soon += 1;
                }
            }
            PrazoStatus::Overdue => {
                stats.overdue += 1;
                stats.overdue_value += value;
            }
            PrazoStatus::Completed => {
                stats.completed += 1;
                stats.completed_value += value;
            }
        }

        *by_priority.entry(prazo.priority).or_insert(0) += 1;
        let kind = prazo
            .obligation_type
            .clone()
            .unwrap_or_else(|| "outros".to_string());
        *by_obligation_type.entry(kind).or_insert(0) += 1;
    }

    stats.by_priority = by_priority;
    stats.by_obligation_type = by_obligation_type;
    stats
}

/// Open deadline counts and values per month, starting at `today`'s month.
pub fn due_series(prazos: &[PrazoFiscal], today: NaiveDate, months: u32) -> DueSeries {
    let first = month_start(today);
    let mut series = DueSeries {
        months: Vec::new(),
        counts: Vec::new(),
        values: Vec::new(),
    };

    for offset in 0..months {
        let Some(month) = first.checked_add_months(Months::new(offset)) else {
            break;
        };
        let open_in_month = prazos.iter().filter(|p| {
            p.is_open() && p.due_date.year() == month.year() && p.due_date.month() == month.month()
        });
        let (count, value) = open_in_month.fold((0usize, 0.0f64), |(c, v), p| (c + 1, v + p.amount.unwrap_or(0.0)));
        series.months.push(format!("{}-{:02}", month.year(), month.month()));
        series.counts.push(count);
        series.values.push(value);
    }
    series
}

fn validate_description(errors: &mut ValidationErrors, description: &str) {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        errors.push("description", "Description is required");
    } else if trimmed.chars().count() > MAX_DESCRIPTION_LEN {
        errors.push("description", format!("Description exceeds {} characters", MAX_DESCRIPTION_LEN));
    }
}

fn validate_amount(errors: &mut ValidationErrors, amount: Option<f64>) {
    if let Some(amount) = amount {
        if !amount.is_finite() || amount < 0.0 {
            errors.push("amount", "Amount must be a non-negative number");
        }
    }
}

fn validate_due_date(errors: &mut ValidationErrors, raw: &str) -> Option<NaiveDate> {
    match parse_date(raw) {
        Some(date) if DUE_YEARS.contains(&date.year()) => Some(date),
        Some(_) => {
            errors.push("due_date", format!("Due date needs a four-digit year: {}", raw));
            None
        }
        None => {
            errors.push("due_date", format!("Invalid due date: {}", raw));
            None
        }
    }
}

/// Pure check of a create request; runs before anything touches storage.
pub fn validate_create(input: &CreatePrazoInput) -> AppResult<NaiveDate> {
    let mut errors = ValidationErrors::default();
    validate_description(&mut errors, &input.description);
    if input.company_id.trim().is_empty() {
        errors.push("company_id", "Company is required");
    }
    let due_date = match input.due_date.as_deref().map(str::trim) {
        None | Some("") => {
            errors.push("due_date", "Due date is required");
            None
        }
        Some(raw) => validate_due_date(&mut errors, raw),
    };
    validate_amount(&mut errors, input.amount);

    errors.into_result()?;
    due_date.ok_or_else(|| AppError::validation("due_date", "Due date is required"))
}

/// Validates `input` and builds the pending deadline it describes, without
/// storing it.
pub fn build_prazo(session: &UserSession, input: CreatePrazoInput) -> AppResult<PrazoFiscal> {
    let due_date = validate_create(&input)?;

    let now = now_rfc3339();
    Ok(PrazoFiscal {
        id: new_id(),
        user_id: session.user_id.clone(),
        company_id: input.company_id.trim().to_string(),
        description: input.description.trim().to_string(),
        obligation_type: clean(input.obligation_type),
        due_date,
        status: PrazoStatus::Pending,
        priority: input.priority.unwrap_or_default(),
        amount: input.amount,
        notes: clean(input.notes),
        source_document_id: input.source_document_id,
        completed_at: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Post-write steps for a stored deadline: invalidate, then notify.
pub fn announce_created(session: &UserSession, prazo: &PrazoFiscal) -> AppResult<()> {
    session.invalidate_prazos()?;
    tracing::info!(user = %session.user_id, prazo = %prazo.id, due = %prazo.due_date, "deadline created");

    session.notify(
        NotificationKind::DeadlineCreated,
        "Prazo cadastrado",
        &describe(prazo),
        Some(&prazo.id),
    )?;
    Ok(())
}

pub fn create_prazo(db: &Mutex<Database>, session: &UserSession, input: CreatePrazoInput) -> AppResult<PrazoFiscal> {
    let prazo = build_prazo(session, input)?;
    lock_db(db)?.insert_prazo(&prazo)?;
    announce_created(session, &prazo)?;
    Ok(prazo)
}

pub fn update_prazo(
    db: &Mutex<Database>,
    session: &UserSession,
    input: UpdatePrazoInput,
    today: NaiveDate,
) -> AppResult<PrazoFiscal> {
    let mut errors = ValidationErrors::default();
    if input.id.trim().is_empty() {
        errors.push("id", "Deadline id is required");
    }
    if let Some(description) = &input.description {
        validate_description(&mut errors, description);
    }
    if let Some(company_id) = &input.company_id {
        if company_id.trim().is_empty() {
            errors.push("company_id", "Company cannot be empty");
        }
    }
    let due_date = match input.due_date.as_deref() {
        Some(raw) => validate_due_date(&mut errors, raw),
        None => None,
    };
    validate_amount(&mut errors, input.amount);
    errors.into_result()?;

    let updated = {
        let db = lock_db(db)?;
        let mut prazo = db
            .get_prazo(&session.user_id, &input.id)?
            .ok_or_else(|| AppError::not_found("deadline", &input.id))?;

        if let Some(description) = input.description {
            prazo.description = description.trim().to_string();
        }
        if let Some(company_id) = input.company_id {
            prazo.company_id = company_id.trim().to_string();
        }
        if input.obligation_type.is_some() {
            prazo.obligation_type = clean(input.obligation_type);
        }
        if let Some(priority) = input.priority {
            prazo.priority = priority;
        }
        if input.amount.is_some() {
            prazo.amount = input.amount;
        }
        if input.notes.is_some() {
            prazo.notes = clean(input.notes);
        }
        if let Some(due_date) = due_date {
            prazo.due_date = due_date;
            if prazo.status == PrazoStatus::Overdue && due_date >= today {
                prazo.status = PrazoStatus::Pending;
            }
        }

        let now = now_rfc3339();
        if let Some(status) = input.status {
            apply_status(&mut prazo, status, &now);
        }
        prazo.updated_at = now;

        if !db.update_prazo(&prazo)? {
            return Err(AppError::not_found("deadline", &prazo.id));
        }
        prazo
    };

    session.invalidate_prazos()?;
    tracing::info!(user = %session.user_id, prazo = %updated.id, status = %updated.status, "deadline updated");
    session.notify(
        NotificationKind::DeadlineUpdated,
        "Prazo atualizado",
        &describe(&updated),
        Some(&updated.id),
    )?;

    let mut view = updated;
    view.status = view.effective_status(today);
    Ok(view)
}

pub fn complete_prazo(db: &Mutex<Database>, session: &UserSession, id: &str, today: NaiveDate) -> AppResult<PrazoFiscal> {
    update_prazo(
        db,
        session,
        UpdatePrazoInput {
            id: id.to_string(),
            status: Some(PrazoStatus::Completed),
            ..Default::default()
        },
        today,
    )
}

fn apply_status(prazo: &mut PrazoFiscal, status: PrazoStatus, now: &str) {
    match status {
        PrazoStatus::Completed => {
            if prazo.completed_at.is_none() {
                prazo.completed_at = Some(now.to_string());
            }
        }
        PrazoStatus::Pending | PrazoStatus::Overdue => prazo.completed_at = None,
    }
    prazo.status = status;
}

fn clean(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn describe(prazo: &PrazoFiscal) -> String {
    match prazo.amount {
        Some(amount) => format!(
            "{} vence em {} (R$ {})",
            prazo.description,
            prazo.due_date.format("%d/%m/%Y"),
            format_decimal(amount)
        ),
        None => format!("{} vence em {}", prazo.description, prazo.due_date.format("%d/%m/%Y")),
    }
}
