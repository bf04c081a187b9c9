//! Esquema Diesel (mantenido a mano). Reemplazable con `diesel print-schema`.

diesel::table! {
    tune_recommendations (id) {
        id -> Text,
        sql_fix -> Text,
        rollback_sql -> Nullable<Text>,
        original_query -> Text,
        tables -> Jsonb,
        applied -> Bool,
        applied_at -> Nullable<Timestamptz>,
        status -> Text,
        risk_level -> Text,
    }
}

diesel::table! {
    tune_jobs (id) {
        id -> Uuid,
        recommendation_id -> Text,
        job_type -> Text,
        status -> Text,
        created_at -> Timestamptz,
        started_at -> Nullable<Timestamptz>,
        completed_at -> Nullable<Timestamptz>,
        result -> Nullable<Jsonb>,
        error_message -> Nullable<Text>,
    }
}

diesel::table! {
    tune_applied_changes (recommendation_id) {
        recommendation_id -> Text,
        sql_executed -> Text,
        schema_name -> Text,
        applied_at -> Timestamptz,
        rollback_sql -> Nullable<Text>,
        status -> Text,
        rolled_back_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    tune_audit_log (id) {
        id -> BigInt,
        action_type -> Text,
        recommendation_id -> Text,
        details -> Jsonb,
        risk_level -> Text,
        status -> Text,
        created_at -> Timestamptz,
    }
}

diesel::allow_tables_to_appear_in_same_query!(tune_recommendations, tune_jobs, tune_applied_changes, tune_audit_log,);
