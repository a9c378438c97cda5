// Copyright (C) 2024 Weft, Inc.
//
// Weft is offered under the AGPL v3.0 and as commercial software.
// For commercial licensing, contact us at hello@weft.io.
//
// AGPL:
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::InferenceError;

/// Request-per-second quota in front of one provider.
///
/// Callers await [`ProviderRateLimiter::acquire`] before every request, so a
/// burst of embedding batches smooths out instead of tripping the provider's
/// own rate limit.
pub struct ProviderRateLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl ProviderRateLimiter {
    pub fn per_second(requests_per_second: u32) -> Result<Self, InferenceError> {
        let quota = NonZeroU32::new(requests_per_second).ok_or_else(|| {
            InferenceError::Configuration("rate limit must be positive".to_string())
        })?;
        Ok(Self {
            limiter: RateLimiter::direct(Quota::per_second(quota)),
        })
    }

    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}
