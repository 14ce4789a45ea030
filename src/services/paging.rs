use crate::error::TenantError;

const DEFAULT_PAGE_SIZE: i64 = 20;
const MAX_PAGE_SIZE: i64 = 100;

/// Offset pagination shared by the admin listings. The page token is the
/// decimal offset of the next page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub size: i64,
    pub offset: i64,
}

impl PageRequest {
    pub fn parse(page_size: Option<i64>, page_token: Option<&str>) -> Result<Self, TenantError> {
        let size = page_size.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = match page_token {
            None | Some("") => 0,
            Some(token) => token
                .parse::<i64>()
                .ok()
                .filter(|offset| *offset >= 0)
                .ok_or_else(|| TenantError::InvalidInput(format!("invalid page token: {token}")))?,
        };
        Ok(Self { size, offset })
    }

    pub fn next_token(&self, returned: usize, total: i64) -> Option<String> {
        let next = self.offset + returned as i64;
        (returned > 0 && next < total).then(|| next.to_string())
    }
}
