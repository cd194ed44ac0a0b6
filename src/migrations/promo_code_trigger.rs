use crate::migrations::{Migration, Step};

const CREATE_GENERATOR: &str = r#"
CREATE OR REPLACE FUNCTION generate_unique_promo_code(business_name_input TEXT)
RETURNS TEXT
LANGUAGE plpgsql
AS $$
DECLARE
    promo_code TEXT;
    base_code TEXT;
    random_suffix TEXT;
    counter INTEGER := 0;
BEGIN
    base_code := UPPER(REGEXP_REPLACE(business_name_input, '[^A-Za-z0-9]', '', 'g'));
    base_code := SUBSTRING(base_code FROM 1 FOR 6);

    IF LENGTH(base_code) < 3 THEN
        base_code := base_code || SUBSTRING(MD5(RANDOM()::TEXT) FROM 1 FOR (6 - LENGTH(base_code)));
    END IF;

    LOOP
        random_suffix := UPPER(SUBSTRING(MD5(RANDOM()::TEXT || CLOCK_TIMESTAMP()::TEXT) FROM 1 FOR 4));
        promo_code := base_code || random_suffix;

        IF NOT EXISTS (SELECT 1 FROM vendors WHERE promo_code = promo_code) THEN
            RETURN promo_code;
        END IF;

        counter := counter + 1;
        IF counter >= 100 THEN
            promo_code := 'RM' || UPPER(SUBSTRING(MD5(RANDOM()::TEXT) FROM 1 FOR 8));
            RETURN promo_code;
        END IF;
    END LOOP;
END;
$$;
"#;

const CREATE_TRIGGER_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION auto_generate_promo_code()
RETURNS TRIGGER
LANGUAGE plpgsql
AS $$
BEGIN
    IF NEW.promo_code IS NULL OR NEW.promo_code = '' THEN
        NEW.promo_code := generate_unique_promo_code(
            COALESCE(NEW.business_name, NEW.owner_name, 'VENDOR')
        );
    END IF;
    RETURN NEW;
END;
$$;
"#;

const DROP_TRIGGER: &str =
    "DROP TRIGGER IF EXISTS trigger_auto_generate_promo_code ON vendors;";

const CREATE_TRIGGER: &str = r#"
CREATE TRIGGER trigger_auto_generate_promo_code
    BEFORE INSERT ON vendors
    FOR EACH ROW
    EXECUTE FUNCTION auto_generate_promo_code();
"#;

// information_schema columns are domains, cast so they decode as text
const VERIFY_TRIGGER: &str = r#"
SELECT
    trigger_name::text AS trigger_name,
    event_manipulation::text AS event_manipulation,
    action_statement::text AS action_statement
FROM information_schema.triggers
WHERE event_object_table = 'vendors'
AND trigger_name = 'trigger_auto_generate_promo_code';
"#;

pub const MIGRATION: Migration = Migration {
    id: "promo_code_trigger",
    description: "Generate a promo code for every vendor inserted without one",
    steps: &[
        Step {
            description: "Creating generate_unique_promo_code function",
            sql: CREATE_GENERATOR,
        },
        Step {
            description: "Creating auto_generate_promo_code trigger function",
            sql: CREATE_TRIGGER_FUNCTION,
        },
        Step {
            description: "Dropping old trigger if exists",
            sql: DROP_TRIGGER,
        },
        Step {
            description: "Creating trigger on vendors table",
            sql: CREATE_TRIGGER,
        },
    ],
    verify_trigger: Some(VERIFY_TRIGGER),
    caveats: &[
        "generate_unique_promo_code checks `WHERE promo_code = promo_code`, which compares the column with itself, so its uniqueness check does not look at the candidate code",
    ],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statements_are_in_install_order() {
        let sql: Vec<&str> = MIGRATION.steps.iter().map(|s| s.sql.trim()).collect();

        assert_eq!(sql.len(), 4);
        assert!(sql[0].starts_with(
            "CREATE OR REPLACE FUNCTION generate_unique_promo_code(business_name_input TEXT)"
        ));
        assert!(sql[1].starts_with("CREATE OR REPLACE FUNCTION auto_generate_promo_code()"));
        assert_eq!(
            sql[2],
            "DROP TRIGGER IF EXISTS trigger_auto_generate_promo_code ON vendors;"
        );
        assert!(sql[3].starts_with("CREATE TRIGGER trigger_auto_generate_promo_code"));
    }

    #[test]
    fn generator_keeps_retry_policy() {
        assert!(CREATE_GENERATOR.contains("SUBSTRING(base_code FROM 1 FOR 6)"));
        assert!(CREATE_GENERATOR.contains("IF LENGTH(base_code) < 3 THEN"));
        assert!(CREATE_GENERATOR.contains("IF counter >= 100 THEN"));
        assert!(CREATE_GENERATOR
            .contains("promo_code := 'RM' || UPPER(SUBSTRING(MD5(RANDOM()::TEXT) FROM 1 FOR 8));"));
        // Sent as-is, see caveats
        assert!(CREATE_GENERATOR.contains("WHERE promo_code = promo_code"));
        assert_eq!(MIGRATION.caveats.len(), 1);
    }

    #[test]
    fn trigger_fires_before_insert_on_vendors() {
        assert!(CREATE_TRIGGER.contains("BEFORE INSERT ON vendors"));
        assert!(CREATE_TRIGGER.contains("FOR EACH ROW"));
        assert!(CREATE_TRIGGER.contains("EXECUTE FUNCTION auto_generate_promo_code();"));
        assert!(CREATE_TRIGGER_FUNCTION
            .contains("IF NEW.promo_code IS NULL OR NEW.promo_code = '' THEN"));
        assert!(CREATE_TRIGGER_FUNCTION
            .contains("COALESCE(NEW.business_name, NEW.owner_name, 'VENDOR')"));
    }

    #[test]
    fn verification_targets_information_schema() {
        let verify = MIGRATION.verify_trigger.unwrap();
        assert!(verify.contains("FROM information_schema.triggers"));
        assert!(verify.contains("WHERE event_object_table = 'vendors'"));
        assert!(verify.contains("AND trigger_name = 'trigger_auto_generate_promo_code';"));
    }
}
