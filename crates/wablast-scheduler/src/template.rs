//! Per-contact message rendering.
//!
//! `{name}`, `{first_name}`, `{phone}` and `{tag}` come from the contact
//! record; any other `{key}` is looked up in the contact's variables.
//! Unknown placeholders are left untouched.

use wablast_core::types::Contact;

pub fn render(template: &str, contact: &Contact) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_key(&after[..end]) => {
                let key = &after[..end];
                match lookup(contact, key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn is_key(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lookup<'a>(contact: &'a Contact, key: &str) -> Option<&'a str> {
    match key {
        "name" => Some(contact.name.as_str()),
        "first_name" => Some(contact.name.split_whitespace().next().unwrap_or("")),
        "phone" => Some(contact.destination.as_str()),
        "tag" => Some(contact.variables.get("tag").map(String::as_str).unwrap_or("")),
        other => contact.variables.get(other).map(String::as_str),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_placeholders() {
        let c = Contact::new("5511999990000", "Ana Souza").with_var("tag", "vip");
        assert_eq!(
            render("Hi {first_name} ({name}) #{tag} {phone}", &c),
            "Hi Ana (Ana Souza) #vip 5511999990000"
        );
    }

    #[test]
    fn test_custom_variables_and_unknowns() {
        let c = Contact::new("5511999990000", "Bruno").with_var("coupon", "SAVE10");
        assert_eq!(render("Use {coupon} now, {missing}!", &c), "Use SAVE10 now, {missing}!");
    }

    #[test]
    fn test_tag_missing_renders_empty() {
        let c = Contact::new("5511999990000", "Bruno");
        assert_eq!(render("[{tag}]", &c), "[]");
    }

    #[test]
    fn test_unbalanced_braces_pass_through() {
        let c = Contact::new("5511999990000", "Bruno");
        assert_eq!(render("json: {\"a\": 1} and {name", &c), "json: {\"a\": 1} and {name");
        assert_eq!(render("{}{name}", &c), "{}Bruno");
    }
}
